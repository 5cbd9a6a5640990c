use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::error::{ApiError, ApiResult};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const DEFAULT_FIX_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CLUSTER_DISTANCE_M: f64 = 100.0;

/// Location metadata attached to a site photo. A photo that yielded no
/// usable fix carries the zero placeholder (latitude 0, longitude 0,
/// accuracy 0), which every consumer must read as "no location", never as a
/// real point at the origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeotagData {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    /// GPS accuracy radius in meters, when the source reported one.
    pub accuracy: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl GeotagData {
    pub fn new(latitude: f64, longitude: f64, accuracy: Option<f64>) -> Self {
        GeotagData {
            latitude: Some(latitude),
            longitude: Some(longitude),
            altitude: None,
            accuracy,
            timestamp: None,
        }
    }

    pub fn placeholder() -> Self {
        GeotagData {
            latitude: Some(0.0),
            longitude: Some(0.0),
            altitude: None,
            accuracy: Some(0.0),
            timestamp: None,
        }
    }

    /// True when the coordinates carry an actual fix. Absent coordinates and
    /// the zero placeholder both count as "no location".
    pub fn has_fix(&self) -> bool {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => lat != 0.0 || lon != 0.0,
            _ => false,
        }
    }

    fn lat(&self) -> f64 {
        self.latitude.unwrap_or(0.0)
    }
    fn lon(&self) -> f64 {
        self.longitude.unwrap_or(0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyClass {
    High,
    Medium,
    Low,
    Unknown,
}

impl fmt::Display for AccuracyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccuracyClass::High => "high",
            AccuracyClass::Medium => "medium",
            AccuracyClass::Low => "low",
            AccuracyClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeotagValidation {
    pub is_valid: bool,
    pub accuracy: AccuracyClass,
    pub warnings: Vec<String>,
}

/// Accuracy radius classification: <=10 m high, <=50 m medium, beyond that
/// low (with a warning), unreported unknown. A missing or placeholder fix is
/// invalid with class unknown.
pub fn validate_geotag(geotag: &GeotagData) -> GeotagValidation {
    let mut warnings: Vec<String> = Vec::new();

    if !geotag.has_fix() {
        warnings.push("no location fix recorded for this photo".to_string());
        return GeotagValidation {
            is_valid: false,
            accuracy: AccuracyClass::Unknown,
            warnings,
        };
    }

    let lat = geotag.lat();
    let lon = geotag.lon();
    if !(-90.0..=90.0).contains(&lat) {
        warnings.push(format!("latitude {lat} is outside [-90, 90]"));
    }
    if !(-180.0..=180.0).contains(&lon) {
        warnings.push(format!("longitude {lon} is outside [-180, 180]"));
    }

    let accuracy = match geotag.accuracy {
        Some(radius) if radius <= 10.0 => AccuracyClass::High,
        Some(radius) if radius <= 50.0 => AccuracyClass::Medium,
        Some(radius) => {
            warnings.push(format!("low GPS accuracy ({radius:.0} m radius)"));
            AccuracyClass::Low
        }
        None => AccuracyClass::Unknown,
    };

    GeotagValidation {
        is_valid: warnings.is_empty(),
        accuracy,
        warnings,
    }
}

/// Great-circle distance in meters between two geotags (haversine,
/// R = 6 371 000 m). Placeholder coordinates resolve to the origin, so only
/// call this for geotags with a real fix when the result matters.
pub fn distance_m(a: &GeotagData, b: &GeotagData) -> f64 {
    let phi1 = a.lat().to_radians();
    let phi2 = b.lat().to_radians();
    let d_phi = (b.lat() - a.lat()).to_radians();
    let d_lambda = (b.lon() - a.lon()).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Seed-based greedy partition of geotags by proximity, returned as groups
/// of input indices. Each unprocessed geotag in input order seeds a group
/// and absorbs every remaining geotag within `max_distance_m` of the seed
/// (not of each other). The result is order-dependent and non-transitive: a
/// geotag close to a non-seed member but beyond range of the seed starts its
/// own group. Accepted approximation, not a clustering-quality guarantee.
pub fn group_by_location(geotags: &[GeotagData], max_distance_m: f64) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut processed = vec![false; geotags.len()];

    for seed in 0..geotags.len() {
        if processed[seed] {
            continue;
        }
        processed[seed] = true;
        let mut group = vec![seed];
        for candidate in seed + 1..geotags.len() {
            if processed[candidate] {
                continue;
            }
            if distance_m(&geotags[seed], &geotags[candidate]) <= max_distance_m {
                processed[candidate] = true;
                group.push(candidate);
            }
        }
        groups.push(group);
    }
    groups
}

/// One live device fix, supplied by the client alongside the upload. Boxed
/// future so tests can plug in slow or failing providers.
pub trait LocationProvider {
    fn current_fix(&self) -> BoxFuture<'_, ApiResult<GeotagData>>;
}

/// Fix already delivered with the request payload.
pub struct SuppliedFix(pub GeotagData);

impl LocationProvider for SuppliedFix {
    fn current_fix(&self) -> BoxFuture<'_, ApiResult<GeotagData>> {
        let fix = self.0.clone();
        Box::pin(async move { Ok(fix) })
    }
}

/// Derive the geotag for an uploaded photo: embedded EXIF GPS first, then
/// one live fix bounded by `timeout_ms`, then the zero placeholder. Only an
/// unreadable image aborts the flow; a missing fix never does.
pub async fn resolve_geotag(
    image: &[u8],
    provider: Option<&dyn LocationProvider>,
    timeout_ms: u64,
) -> ApiResult<GeotagData> {
    if let Some(geotag) = extract_from_image(image)? {
        return Ok(geotag);
    }

    if let Some(provider) = provider {
        match timeout(Duration::from_millis(timeout_ms), provider.current_fix()).await {
            Ok(Ok(fix)) if fix.has_fix() => return Ok(fix),
            Ok(Ok(_)) | Ok(Err(_)) => {
                warn!("live location fix unavailable, using placeholder geotag");
            }
            Err(_) => {
                warn!("{}", ApiError::GeolocationTimeout(timeout_ms));
            }
        }
    }

    Ok(GeotagData::placeholder())
}

// --- EXIF GPS extraction -------------------------------------------------
//
// No external EXIF dependency: the subset we need (JPEG APP1 -> TIFF -> IFD0
// -> GPS IFD -> coordinate rationals) is small enough to parse directly.

const TAG_GPS_IFD_POINTER: u16 = 0x8825;
const TAG_GPS_LATITUDE_REF: u16 = 0x0001;
const TAG_GPS_LATITUDE: u16 = 0x0002;
const TAG_GPS_LONGITUDE_REF: u16 = 0x0003;
const TAG_GPS_LONGITUDE: u16 = 0x0004;
const TAG_GPS_ALTITUDE_REF: u16 = 0x0005;
const TAG_GPS_ALTITUDE: u16 = 0x0006;
const TAG_GPS_TIMESTAMP: u16 = 0x0007;
const TAG_GPS_DATESTAMP: u16 = 0x001D;

/// Parse the embedded GPS metadata of a JPEG (or bare TIFF) image.
/// `Ok(None)` means the image is readable but carries no usable GPS block;
/// `ApiError::Extraction` means the binary itself is unreadable.
pub fn extract_from_image(bytes: &[u8]) -> ApiResult<Option<GeotagData>> {
    if bytes.len() >= 4 && (&bytes[..2] == b"II" || &bytes[..2] == b"MM") {
        return Ok(parse_tiff_gps(bytes));
    }
    let tiff = find_exif_payload(bytes)?;
    Ok(tiff.and_then(parse_tiff_gps))
}

/// Walk the JPEG segment chain looking for the APP1/Exif payload. Structural
/// damage (bad magic, truncated segments) is an extraction error; a JPEG
/// that simply has no EXIF block is not.
fn find_exif_payload(bytes: &[u8]) -> ApiResult<Option<&[u8]>> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return Err(ApiError::Extraction("not a JPEG image".to_string()));
    }
    let mut pos = 2;
    while pos + 2 <= bytes.len() {
        if bytes[pos] != 0xFF {
            return Err(ApiError::Extraction("corrupt JPEG segment chain".to_string()));
        }
        // any number of 0xFF fill bytes may precede a marker (ITU T.81 B.1.1.2)
        while pos + 1 < bytes.len() && bytes[pos + 1] == 0xFF {
            pos += 1;
        }
        if pos + 2 > bytes.len() {
            break;
        }
        let marker = bytes[pos + 1];
        // Start-of-scan: no metadata segments past this point.
        if marker == 0xDA || marker == 0xD9 {
            return Ok(None);
        }
        if pos + 4 > bytes.len() {
            return Err(ApiError::Extraction("truncated JPEG segment".to_string()));
        }
        let length = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if length < 2 || pos + 2 + length > bytes.len() {
            return Err(ApiError::Extraction("truncated JPEG segment".to_string()));
        }
        let payload = &bytes[pos + 4..pos + 2 + length];
        if marker == 0xE1 && payload.len() > 6 && &payload[..6] == b"Exif\0\0" {
            return Ok(Some(&payload[6..]));
        }
        pos += 2 + length;
    }
    Ok(None)
}

struct TiffReader<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl<'a> TiffReader<'a> {
    fn new(data: &'a [u8]) -> Option<Self> {
        let big_endian = match data.get(..2)? {
            b"II" => false,
            b"MM" => true,
            _ => return None,
        };
        let reader = TiffReader { data, big_endian };
        // TIFF magic number
        if reader.u16(2)? != 42 {
            return None;
        }
        Some(reader)
    }

    fn u16(&self, offset: usize) -> Option<u16> {
        let raw: [u8; 2] = self.data.get(offset..offset + 2)?.try_into().ok()?;
        Some(if self.big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        })
    }

    fn u32(&self, offset: usize) -> Option<u32> {
        let raw: [u8; 4] = self.data.get(offset..offset + 4)?.try_into().ok()?;
        Some(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }

    fn rational(&self, offset: usize) -> Option<f64> {
        let numerator = self.u32(offset)? as f64;
        let denominator = self.u32(offset + 4)? as f64;
        if denominator == 0.0 {
            return None;
        }
        Some(numerator / denominator)
    }

    /// Find an IFD entry by tag; returns (type, count, value-or-offset word
    /// position).
    fn find_entry(&self, ifd_offset: usize, tag: u16) -> Option<(u16, u32, usize)> {
        let count = self.u16(ifd_offset)? as usize;
        for i in 0..count {
            let entry = ifd_offset + 2 + i * 12;
            if self.u16(entry)? == tag {
                return Some((self.u16(entry + 2)?, self.u32(entry + 4)?, entry + 8));
            }
        }
        None
    }

    /// ASCII entry payload, inline when it fits the value word.
    fn ascii(&self, ifd_offset: usize, tag: u16) -> Option<String> {
        let (kind, count, value_pos) = self.find_entry(ifd_offset, tag)?;
        if kind != 2 {
            return None;
        }
        let count = count as usize;
        let start = if count <= 4 {
            value_pos
        } else {
            self.u32(value_pos)? as usize
        };
        let raw = self.data.get(start..start + count)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn rationals(&self, ifd_offset: usize, tag: u16, n: usize) -> Option<Vec<f64>> {
        let (kind, count, value_pos) = self.find_entry(ifd_offset, tag)?;
        if kind != 5 || (count as usize) < n {
            return None;
        }
        let start = self.u32(value_pos)? as usize;
        (0..n).map(|i| self.rational(start + i * 8)).collect()
    }
}

fn dms_to_degrees(dms: &[f64], reference: &str) -> f64 {
    let degrees = dms[0] + dms[1] / 60.0 + dms[2] / 3600.0;
    if matches!(reference, "S" | "W") {
        -degrees
    } else {
        degrees
    }
}

/// GPS IFD of an EXIF TIFF block. Any structural inconsistency inside the
/// block is treated as "no GPS data", not as an error.
fn parse_tiff_gps(tiff: &[u8]) -> Option<GeotagData> {
    let reader = TiffReader::new(tiff)?;
    let ifd0 = reader.u32(4)? as usize;
    let (_, _, pointer_pos) = reader.find_entry(ifd0, TAG_GPS_IFD_POINTER)?;
    let gps_ifd = reader.u32(pointer_pos)? as usize;

    let lat_ref = reader.ascii(gps_ifd, TAG_GPS_LATITUDE_REF)?;
    let lat_dms = reader.rationals(gps_ifd, TAG_GPS_LATITUDE, 3)?;
    let lon_ref = reader.ascii(gps_ifd, TAG_GPS_LONGITUDE_REF)?;
    let lon_dms = reader.rationals(gps_ifd, TAG_GPS_LONGITUDE, 3)?;

    let altitude = reader.rationals(gps_ifd, TAG_GPS_ALTITUDE, 1).map(|v| {
        // Altitude ref byte 1 means below sea level.
        let below = reader
            .find_entry(gps_ifd, TAG_GPS_ALTITUDE_REF)
            .and_then(|(_, _, pos)| reader.data.get(pos).copied())
            == Some(1);
        if below {
            -v[0]
        } else {
            v[0]
        }
    });

    Some(GeotagData {
        latitude: Some(dms_to_degrees(&lat_dms, &lat_ref)),
        longitude: Some(dms_to_degrees(&lon_dms, &lon_ref)),
        altitude,
        accuracy: None,
        timestamp: parse_gps_timestamp(&reader, gps_ifd),
    })
}

/// GPSDateStamp ("YYYY:MM:DD") plus GPSTimeStamp (three rationals), both in
/// UTC per the EXIF spec.
fn parse_gps_timestamp(reader: &TiffReader, gps_ifd: usize) -> Option<DateTime<Utc>> {
    let date = reader.ascii(gps_ifd, TAG_GPS_DATESTAMP)?;
    let time = reader.rationals(gps_ifd, TAG_GPS_TIMESTAMP, 3)?;

    let mut parts = date.split(':');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(
        time[0] as u32,
        time[1] as u32,
        time[2] as u32,
    )?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    // meters-per-degree at the equator, for building fixture coordinates
    const DEG_PER_M: f64 = 1.0 / 111_194.93;

    fn at(lat: f64, lon: f64) -> GeotagData {
        GeotagData::new(lat, lon, None)
    }

    #[test]
    fn distance_to_self_is_zero() {
        let p = at(37.8083, -122.4156);
        assert_eq!(distance_m(&p, &p), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = at(37.8083, -122.4156);
        let b = at(37.8090, -122.4170);
        assert!((distance_m(&a, &b) - distance_m(&b, &a)).abs() < 1e-9);
    }

    #[test]
    fn one_degree_of_longitude_at_equator() {
        let d = distance_m(&at(0.0, 0.0), &at(0.0, 1.0));
        assert!((d - 111_195.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn accuracy_classification() {
        let mut tag = at(1.0, 1.0);
        tag.accuracy = Some(5.0);
        let v = validate_geotag(&tag);
        assert_eq!(v.accuracy, AccuracyClass::High);
        assert!(v.is_valid && v.warnings.is_empty());

        tag.accuracy = Some(30.0);
        assert_eq!(validate_geotag(&tag).accuracy, AccuracyClass::Medium);

        tag.accuracy = Some(75.0);
        let v = validate_geotag(&tag);
        assert_eq!(v.accuracy, AccuracyClass::Low);
        assert!(!v.is_valid);
        assert_eq!(v.warnings.len(), 1);

        tag.accuracy = None;
        assert_eq!(validate_geotag(&tag).accuracy, AccuracyClass::Unknown);
    }

    #[test]
    fn missing_coordinates_are_invalid() {
        let tag = GeotagData {
            latitude: None,
            longitude: None,
            altitude: None,
            accuracy: Some(5.0),
            timestamp: None,
        };
        let v = validate_geotag(&tag);
        assert!(!v.is_valid);
        assert_eq!(v.accuracy, AccuracyClass::Unknown);
        assert_eq!(v.warnings.len(), 1);
    }

    #[test]
    fn placeholder_means_no_location() {
        let v = validate_geotag(&GeotagData::placeholder());
        assert!(!v.is_valid);
        assert_eq!(v.accuracy, AccuracyClass::Unknown);
    }

    #[test]
    fn out_of_range_coordinates_warn_without_clamping() {
        let tag = at(95.0, 200.0);
        let v = validate_geotag(&tag);
        assert!(!v.is_valid);
        assert_eq!(v.warnings.len(), 2);
        assert_eq!(tag.latitude, Some(95.0));
    }

    // dist(A,B)=50 m, dist(A,C)~150 m, dist(B,C)~120 m: B joins seed A's
    // group, C starts its own even though it is within range of B.
    #[test]
    fn clustering_is_seed_based_not_transitive() {
        let a = at(0.0, 0.0);
        let b = at(50.0 * DEG_PER_M, 0.0);
        let c = at(106.0 * DEG_PER_M, 106.13 * DEG_PER_M);
        assert!((distance_m(&a, &b) - 50.0).abs() < 1.0);
        assert!((distance_m(&a, &c) - 150.0).abs() < 1.0);
        assert!((distance_m(&b, &c) - 120.0).abs() < 1.0);

        let groups = group_by_location(&[a, b, c], 100.0);
        assert_eq!(groups, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn clustering_preserves_input_order() {
        let photos = vec![at(0.0, 0.0), at(10.0, 10.0), at(0.0, 0.0001)];
        let groups = group_by_location(&photos, 100.0);
        assert_eq!(groups, vec![vec![0, 2], vec![1]]);
    }

    // --- EXIF fixtures ---------------------------------------------------

    fn le16(v: u16) -> [u8; 2] {
        v.to_le_bytes()
    }
    fn le32(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn entry(out: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: u32) {
        out.extend_from_slice(&le16(tag));
        out.extend_from_slice(&le16(kind));
        out.extend_from_slice(&le32(count));
        out.extend_from_slice(&le32(value));
    }

    fn rational(out: &mut Vec<u8>, numerator: u32, denominator: u32) {
        out.extend_from_slice(&le32(numerator));
        out.extend_from_slice(&le32(denominator));
    }

    /// Little-endian TIFF block: IFD0 with a GPS pointer, GPS IFD with
    /// latitude 37°48'30" S and longitude 122°24'56.16" W.
    fn gps_tiff() -> Vec<u8> {
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"II");
        tiff.extend_from_slice(&le16(42));
        tiff.extend_from_slice(&le32(8));

        // IFD0 at 8: one entry pointing at the GPS IFD (offset 26)
        tiff.extend_from_slice(&le16(1));
        entry(&mut tiff, TAG_GPS_IFD_POINTER, 4, 1, 26);
        tiff.extend_from_slice(&le32(0));

        // GPS IFD at 26: 4 entries -> 2 + 48 + 4 = 54 bytes, data at 80
        tiff.extend_from_slice(&le16(4));
        entry(&mut tiff, TAG_GPS_LATITUDE_REF, 2, 2, u32::from_le_bytes(*b"S\0\0\0"));
        entry(&mut tiff, TAG_GPS_LATITUDE, 5, 3, 80);
        entry(&mut tiff, TAG_GPS_LONGITUDE_REF, 2, 2, u32::from_le_bytes(*b"W\0\0\0"));
        entry(&mut tiff, TAG_GPS_LONGITUDE, 5, 3, 104);
        tiff.extend_from_slice(&le32(0));

        // latitude rationals at 80
        rational(&mut tiff, 37, 1);
        rational(&mut tiff, 48, 1);
        rational(&mut tiff, 30, 1);
        // longitude rationals at 104
        rational(&mut tiff, 122, 1);
        rational(&mut tiff, 24, 1);
        rational(&mut tiff, 5616, 100);
        tiff
    }

    fn jpeg_with(tiff: &[u8]) -> Vec<u8> {
        let mut jpeg = vec![0xFF, 0xD8];
        let payload_len = (2 + 6 + tiff.len()) as u16;
        jpeg.extend_from_slice(&[0xFF, 0xE1]);
        jpeg.extend_from_slice(&payload_len.to_be_bytes());
        jpeg.extend_from_slice(b"Exif\0\0");
        jpeg.extend_from_slice(tiff);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn extracts_coordinates_from_exif() {
        let jpeg = jpeg_with(&gps_tiff());
        let geotag = extract_from_image(&jpeg).unwrap().unwrap();
        let lat = geotag.latitude.unwrap();
        let lon = geotag.longitude.unwrap();
        assert!((lat + 37.808_333).abs() < 1e-4, "lat {lat}");
        assert!((lon + 122.415_6).abs() < 1e-4, "lon {lon}");
        assert_eq!(geotag.accuracy, None);
    }

    #[test]
    fn bare_tiff_input_is_accepted() {
        let geotag = extract_from_image(&gps_tiff()).unwrap().unwrap();
        assert!(geotag.has_fix());
    }

    #[test]
    fn jpeg_without_exif_yields_none() {
        // APP0/JFIF only, then end of image
        let jpeg = [
            0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x4A, 0x46, 0xFF, 0xD9,
        ];
        assert_eq!(extract_from_image(&jpeg).unwrap(), None);
    }

    // 0xFF fill bytes before a marker are structure, not corruption: the
    // padded APP0 segment must be walked over, not reported as unreadable.
    #[test]
    fn fill_bytes_before_a_marker_are_skipped() {
        let jpeg = [
            0xFF, 0xD8, 0xFF, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00, 0xFF, 0xD9,
        ];
        assert_eq!(extract_from_image(&jpeg).unwrap(), None);
    }

    #[test]
    fn fill_bytes_before_the_exif_segment_still_extract() {
        let tiff = gps_tiff();
        let mut jpeg = vec![0xFF, 0xD8, 0xFF];
        let payload_len = (2 + 6 + tiff.len()) as u16;
        jpeg.extend_from_slice(&[0xFF, 0xE1]);
        jpeg.extend_from_slice(&payload_len.to_be_bytes());
        jpeg.extend_from_slice(b"Exif\0\0");
        jpeg.extend_from_slice(&tiff);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        assert!(extract_from_image(&jpeg).unwrap().unwrap().has_fix());
    }

    #[test]
    fn exif_without_gps_block_yields_none() {
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"II");
        tiff.extend_from_slice(&le16(42));
        tiff.extend_from_slice(&le32(8));
        tiff.extend_from_slice(&le16(0));
        tiff.extend_from_slice(&le32(0));
        assert_eq!(extract_from_image(&jpeg_with(&tiff)).unwrap(), None);
    }

    #[test]
    fn unreadable_binary_is_an_extraction_error() {
        assert!(matches!(
            extract_from_image(b"definitely not an image"),
            Err(ApiError::Extraction(_))
        ));
        // valid start-of-image but a segment that runs past the buffer
        let truncated = [0xFF, 0xD8, 0xFF, 0xE1, 0xFF, 0xFF, 0x00];
        assert!(matches!(
            extract_from_image(&truncated),
            Err(ApiError::Extraction(_))
        ));
    }

    struct NeverResolves;
    impl LocationProvider for NeverResolves {
        fn current_fix(&self) -> BoxFuture<'_, ApiResult<GeotagData>> {
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test]
    async fn fallback_uses_supplied_fix() {
        let jpeg = jpeg_with(&{
            let mut tiff = Vec::new();
            tiff.extend_from_slice(b"II");
            tiff.extend_from_slice(&le16(42));
            tiff.extend_from_slice(&le32(8));
            tiff.extend_from_slice(&le16(0));
            tiff.extend_from_slice(&le32(0));
            tiff
        });
        let provider = SuppliedFix(GeotagData::new(-6.2, 106.8, Some(8.0)));
        let geotag = resolve_geotag(&jpeg, Some(&provider), 50).await.unwrap();
        assert_eq!(geotag.latitude, Some(-6.2));
    }

    #[tokio::test]
    async fn fallback_timeout_yields_placeholder() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xD9];
        let geotag = resolve_geotag(&jpeg, Some(&NeverResolves), 20).await.unwrap();
        assert_eq!(geotag, GeotagData::placeholder());
    }

    #[tokio::test]
    async fn embedded_gps_wins_over_provider() {
        let jpeg = jpeg_with(&gps_tiff());
        let provider = SuppliedFix(GeotagData::new(1.0, 1.0, Some(5.0)));
        let geotag = resolve_geotag(&jpeg, Some(&provider), 50).await.unwrap();
        assert!((geotag.latitude.unwrap() + 37.808_333).abs() < 1e-4);
    }
}

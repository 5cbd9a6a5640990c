use crate::database::get_db;
use crate::error::{ApiError, ApiResult};
use actix_service::Transform;
use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse},
    Error, HttpMessage,
};
use chrono::Utc;
use futures::{
    future::{ready, LocalBoxFuture, Ready},
    stream::StreamExt,
    FutureExt,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use mongodb::{
    bson::{doc, from_document, oid::ObjectId, to_bson},
    Collection, Database,
};
use pwhash::bcrypt;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::read_to_string, rc::Rc, str::FromStr};

use super::report_status::UserRole;

static mut KEYS: BTreeMap<String, String> = BTreeMap::new();

#[derive(Debug, Serialize, Deserialize)]
struct UserClaims {
    aud: String,
    exp: i64,
    iss: String,
    sub: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
}
#[derive(Debug, Deserialize, Serialize)]
pub struct UserCredential {
    pub email: String,
    pub password: String,
}
#[derive(Debug, Deserialize)]
pub struct UserRefreshRequest {
    pub rtk: String,
}
#[derive(Debug, Default)]
pub struct UserQuery {
    pub role: Option<UserRole>,
    pub limit: Option<usize>,
}
#[derive(Debug, Deserialize, Serialize)]
pub struct UserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
}
#[derive(Debug, Deserialize, Serialize)]
pub struct UserResponse {
    pub _id: Option<ObjectId>,
    pub name: String,
    pub email: String,
    pub role: UserRole,
}

#[derive(Debug)]
pub struct UserAuthenticationData {
    pub _id: ObjectId,
    pub role: UserRole,
    pub token: String,
}
pub struct UserAuthenticationMiddleware<S> {
    service: Rc<S>,
}
pub struct UserAuthenticationMiddlewareFactory;

pub type UserAuthentication = Rc<UserAuthenticationData>;

impl User {
    pub async fn save(&mut self) -> ApiResult<ObjectId> {
        let db: Database = get_db();
        let collection: Collection<User> = db.collection::<User>("users");

        self._id = Some(ObjectId::new());

        let hash = bcrypt::hash(&self.password)
            .map_err(|_| ApiError::Database("password hashing failed".to_string()))?;
        self.password = hash;
        collection
            .insert_one(&*self, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
            .map(|_| self._id.unwrap())
    }
    pub async fn find_many(query: &UserQuery) -> ApiResult<Vec<UserResponse>> {
        let db: Database = get_db();
        let collection: Collection<User> = db.collection::<User>("users");

        let mut pipeline: Vec<mongodb::bson::Document> = Vec::new();

        if let Some(role) = &query.role {
            pipeline.push(doc! {
                "$match": { "role": to_bson::<UserRole>(role)
                    .map_err(|error| ApiError::Database(error.to_string()))? }
            });
        }
        if let Some(limit) = query.limit {
            pipeline.push(doc! {
                "$limit": limit as i64
            });
        }
        pipeline.push(doc! {
            "$project": {
                "name": "$name",
                "email": "$email",
                "role": "$role",
            }
        });

        let mut cursor = collection
            .aggregate(pipeline, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))?;

        let mut users: Vec<UserResponse> = Vec::new();
        while let Some(Ok(document)) = cursor.next().await {
            if let Ok(user) = from_document::<UserResponse>(document) {
                users.push(user);
            }
        }
        Ok(users)
    }
    pub async fn find_by_id(_id: &ObjectId) -> ApiResult<Option<User>> {
        let db: Database = get_db();
        let collection: Collection<User> = db.collection::<User>("users");

        collection
            .find_one(doc! { "_id": _id }, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
    }
    pub async fn find_by_email(email: &str) -> ApiResult<Option<User>> {
        let db: Database = get_db();
        let collection: Collection<User> = db.collection::<User>("users");

        collection
            .find_one(doc! { "email": email }, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
    }

    fn response(&self) -> UserResponse {
        UserResponse {
            _id: self._id,
            name: self.name.clone(),
            email: self.email.clone(),
            role: self.role,
        }
    }
}

impl UserCredential {
    pub async fn authenticate(&self) -> ApiResult<(String, String, UserResponse)> {
        let user = match User::find_by_email(&self.email).await? {
            Some(user) if bcrypt::verify(&self.password, &user.password) => user,
            _ => return Err(ApiError::Unauthorized),
        };
        let _id = user._id.ok_or(ApiError::NotFound("USER"))?;
        let atk = issue_token(&_id, "access", 3_600)?;
        let rtk = issue_token(&_id, "refresh", 604_800)?;
        Ok((atk, rtk, user.response()))
    }

    pub async fn refresh(rtk: &str) -> ApiResult<(String, String, UserResponse)> {
        let _id = verify_token(rtk, "refresh").ok_or(ApiError::Unauthorized)?;
        let user = User::find_by_id(&_id)
            .await?
            .ok_or(ApiError::NotFound("USER"))?;
        let atk = issue_token(&_id, "access", 3_600)?;
        let rtk = issue_token(&_id, "refresh", 604_800)?;
        Ok((atk, rtk, user.response()))
    }
}

fn issue_token(_id: &ObjectId, kind: &str, lifetime_s: i64) -> ApiResult<String> {
    let claims = UserClaims {
        sub: _id.to_hex(),
        exp: Utc::now().timestamp() + lifetime_s,
        iss: "sitetrack".to_string(),
        aud: kind.to_string(),
    };
    let header = Header::new(Algorithm::RS256);
    unsafe {
        let key = KEYS
            .get(&format!("private_{kind}"))
            .ok_or(ApiError::Unauthorized)?;
        let encoding_key =
            EncodingKey::from_rsa_pem(key.as_bytes()).map_err(|_| ApiError::Unauthorized)?;
        encode(&header, &claims, &encoding_key).map_err(|_| ApiError::Unauthorized)
    }
}

fn verify_token(token: &str, kind: &str) -> Option<ObjectId> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[kind]);
    unsafe {
        let key = KEYS.get(&format!("public_{kind}"))?;
        let data = decode::<UserClaims>(
            token,
            &DecodingKey::from_rsa_pem(key.as_bytes()).ok()?,
            &validation,
        )
        .ok()?;
        ObjectId::from_str(&data.claims.sub).ok()
    }
}

impl<S, B> Service<ServiceRequest> for UserAuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv: Rc<S> = self.service.clone();

        async move {
            let bearer = req
                .headers()
                .get("Authorization")
                .and_then(|header| header.to_str().ok())
                .and_then(|header| header.strip_prefix("Bearer "))
                .map(str::to_owned);
            if let Some(token) = bearer {
                if let Some(_id) = verify_token(&token, "access") {
                    if let Ok(Some(user)) = User::find_by_id(&_id).await {
                        let auth_data = UserAuthenticationData {
                            _id,
                            role: user.role,
                            token,
                        };
                        req.extensions_mut()
                            .insert::<UserAuthentication>(Rc::new(auth_data));
                    }
                }
            }
            let res: ServiceResponse<B> = srv.call(req).await?;
            Ok(res)
        }
        .boxed_local()
    }
}
impl<S, B> Transform<S, ServiceRequest> for UserAuthenticationMiddlewareFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = UserAuthenticationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(UserAuthenticationMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub fn load_keys() {
    let private_access =
        read_to_string("./keys/private_access.key").expect("LOAD_FAILED_PRIVATE_ACCESS");
    let public_access =
        read_to_string("./keys/public_access.pem").expect("LOAD_FAILED_PUBLIC_ACCESS");
    let private_refresh =
        read_to_string("./keys/private_refresh.key").expect("LOAD_FAILED_PRIVATE_REFRESH");
    let public_refresh =
        read_to_string("./keys/public_refresh.pem").expect("LOAD_FAILED_PUBLIC_REFRESH");
    unsafe {
        KEYS.insert("private_access".to_string(), private_access);
        KEYS.insert("public_access".to_string(), public_access);
        KEYS.insert("private_refresh".to_string(), private_refresh);
        KEYS.insert("public_refresh".to_string(), public_refresh);
    }
}

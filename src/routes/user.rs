use actix_web::{get, post, web, HttpMessage, HttpRequest, HttpResponse};
use mongodb::bson::{doc, oid::ObjectId, to_bson};
use regex::Regex;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    report_status::UserRole,
    user::{
        User, UserAuthentication, UserCredential, UserQuery, UserRefreshRequest, UserRequest,
        UserResponse,
    },
};

fn issuer(req: &HttpRequest) -> ApiResult<UserAuthentication> {
    req.extensions()
        .get::<UserAuthentication>()
        .cloned()
        .ok_or(ApiError::Unauthorized)
}

#[derive(Debug, Deserialize)]
pub struct UserQueryParams {
    pub role: Option<UserRole>,
    pub limit: Option<usize>,
}

#[get("/users")]
pub async fn get_users(
    query: web::Query<UserQueryParams>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    if issuer.role != UserRole::Admin {
        return Err(ApiError::Unauthorized);
    }
    let users = User::find_many(&UserQuery {
        role: query.role,
        limit: query.limit,
    })
    .await?;
    Ok(HttpResponse::Ok().json(users))
}

#[get("/users/{user_id}")]
pub async fn get_user(user_id: web::Path<String>, req: HttpRequest) -> ApiResult<HttpResponse> {
    issuer(&req)?;
    let user_id: ObjectId = user_id
        .parse()
        .map_err(|_| ApiError::validation("invalid object id"))?;
    match User::find_by_id(&user_id).await? {
        Some(user) => Ok(HttpResponse::Ok().json(UserResponse {
            _id: user._id,
            name: user.name,
            email: user.email,
            role: user.role,
        })),
        None => Err(ApiError::NotFound("USER")),
    }
}

/// Only admins create accounts; the role is fixed at creation.
#[post("/users")]
pub async fn create_user(
    payload: web::Json<UserRequest>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    if issuer.role != UserRole::Admin {
        return Err(ApiError::Unauthorized);
    }

    let payload = payload.into_inner();
    let email_regex = Regex::new(
        r"^([a-z0-9_+]([a-z0-9_+.]*[a-z0-9_+])?)@([a-z0-9]+([\-.][a-z0-9]+)*\.[a-z]{2,6})",
    )
    .map_err(|error| ApiError::Database(error.to_string()))?;
    if !email_regex.is_match(&payload.email) {
        return Err(ApiError::validation("invalid email address"));
    }

    if User::find_by_email(&payload.email).await?.is_some() {
        return Err(ApiError::validation("a user with this email already exists"));
    }

    let mut user = User {
        _id: None,
        name: payload.name,
        email: payload.email,
        password: payload.password,
        role: payload.role,
    };
    let _id = user.save().await?;
    Ok(HttpResponse::Created().body(_id.to_string()))
}

#[post("/users/login")]
pub async fn login(payload: web::Json<UserCredential>) -> ApiResult<HttpResponse> {
    let payload = payload.into_inner();
    let (atk, rtk, user) = payload.authenticate().await?;
    Ok(HttpResponse::Ok().json(doc! {
        "atk": to_bson::<String>(&atk).map_err(|e| ApiError::Database(e.to_string()))?,
        "rtk": to_bson::<String>(&rtk).map_err(|e| ApiError::Database(e.to_string()))?,
        "user": to_bson::<UserResponse>(&user).map_err(|e| ApiError::Database(e.to_string()))?,
    }))
}

#[post("/users/refresh")]
pub async fn refresh(payload: web::Json<UserRefreshRequest>) -> ApiResult<HttpResponse> {
    let payload = payload.into_inner();
    let (atk, rtk, user) = UserCredential::refresh(&payload.rtk).await?;
    Ok(HttpResponse::Ok().json(doc! {
        "atk": to_bson::<String>(&atk).map_err(|e| ApiError::Database(e.to_string()))?,
        "rtk": to_bson::<String>(&rtk).map_err(|e| ApiError::Database(e.to_string()))?,
        "user": to_bson::<UserResponse>(&user).map_err(|e| ApiError::Database(e.to_string()))?,
    }))
}

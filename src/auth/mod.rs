//! Authentication Module
//! Mission: Issue and verify the API's bearer tokens

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::JwtHandler;
pub use middleware::auth_middleware;
pub use models::Claims;

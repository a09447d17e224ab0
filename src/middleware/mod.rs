pub mod auth;
pub mod cors;
pub mod validation;

pub use auth::{AuthenticatedUser, USER_ID_HEADER};
pub use cors::create_cors_layer;
pub use validation::{luhn_valid, parse_order_number, require_content_type, validate_json};

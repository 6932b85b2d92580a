pub mod routes;

pub use routes::{health_check, recharge_webhook, ws_handler};

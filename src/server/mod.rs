pub mod http;
pub mod routes;

pub use http::{serve, start_server};
pub use routes::{create_router, AppState, Principal, PRINCIPAL_HEADER};

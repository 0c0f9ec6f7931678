mod control;
mod public;

pub use control::handle_control_connection;
pub use public::{handle_public_connection, route_token};

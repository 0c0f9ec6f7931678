mod host;
mod id;
mod time;

pub use host::{extract_subdomain, is_loopback_host, resolve_container_host};
pub use id::{SubdomainGenerator, generate_unique_string};
pub use time::current_timestamp_millis;

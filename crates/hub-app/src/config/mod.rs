//! Configuration file parsing for the automation hub
//!
//! Everything lives in one `hub.toml`; see [`Settings`] for the sections.

pub mod settings;
pub mod types;

pub use settings::{
    init_config, load_settings, local_hostname, parse_socket_addr, resolve_host_ip,
    save_settings, validate_settings, CONFIG_FILENAME,
};
pub use types::*;

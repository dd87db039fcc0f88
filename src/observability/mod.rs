mod logging;

pub use logging::{default_log_dir, init_cli, init_daemon};

mod metrics_server;
mod server;
mod settings;

pub use server::{Service, run};
pub use settings::Settings;

use std::time::Duration;

/// Options for the timeout of a connection
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    /// The timeout for establishing a connection
    pub connect_timeout: Duration,
    /// The timeout for reading data from the connection
    pub read_timeout: Duration,
    /// The timeout for writing data to the connection
    pub write_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(20),
        }
    }
}

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::common::error::{SessionFsError, SessionFsResult};

/// Default listen address of the file server
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:50051";

/// Configuration of the file server
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[clap(author, version, about = "SessionFs file server", long_about = None)]
pub struct ServerConfig {
    /// The root directory served to clients
    #[clap(value_name = "ROOT_DIR")]
    pub root_dir: PathBuf,
    #[clap(long = "addr", value_name = "VALUE", default_value = DEFAULT_SERVER_ADDR)]
    /// Listen address
    pub addr: String,
    #[clap(long = "log-level", value_name = "VALUE", default_value = "info")]
    /// Log level
    pub log_level: String,
}

impl ServerConfig {
    /// Check the config is valid before the server starts.
    ///
    /// # Errors
    /// Returns `ArgumentInvalid` when the root directory does not exist
    /// or is not a directory.
    #[inline]
    pub fn validate(&self) -> SessionFsResult<()> {
        if !self.root_dir.is_dir() {
            return Err(SessionFsError::ArgumentInvalid {
                context: vec![format!(
                    "root directory {:?} does not exist or is not a directory",
                    self.root_dir
                )],
            });
        }
        Ok(())
    }
}

/// Configuration of the client mount
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[clap(author, version, about = "SessionFs client mount", long_about = None)]
pub struct MountConfig {
    /// Address of the file server
    #[clap(value_name = "SERVER_ADDR", env = "SESSIONFS_SERVER")]
    pub server_addr: String,
    /// The mount point served to local processes
    #[clap(value_name = "MOUNT_POINT")]
    pub mount_point: PathBuf,
    #[clap(
        long = "cache-root",
        value_name = "VALUE",
        default_value = "./tmp/cache"
    )]
    /// The root of the local whole-file cache
    pub cache_root: PathBuf,
    #[clap(long = "log-level", value_name = "VALUE", default_value = "info")]
    /// Log level
    pub log_level: String,
}

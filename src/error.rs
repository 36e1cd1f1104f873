use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("image '{name}' version '{version}' not found at {location}")]
    #[diagnostic(help("check the image name and version, or pick another version"))]
    ImageNotFound {
        name: String,
        version: String,
        location: String,
    },

    #[error("transfer of {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("target {path} is not writable")]
    #[diagnostic(help("the image directory is usually only writable by root"))]
    TargetNotWritable { path: String },

    #[error("data disk provisioning failed at step '{step}': {message}")]
    DiskProvisioning { step: String, message: String },

    #[error("hypervisor tool failed: {command}: {message}")]
    ToolInvocation { command: String, message: String },

    #[error("unsupported configuration: {message}")]
    UnsupportedConfiguration { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

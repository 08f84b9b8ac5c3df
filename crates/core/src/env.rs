//! Environment contract between the operator and the worker.
//!
//! The operator writes these variables into the worker container; the worker
//! reads them at startup. Credentials are always injected by Secret key
//! reference, never as literal values.

pub const QUEUE_HOST: &str = "QUEUE_HOST";
pub const QUEUE_PORT: &str = "QUEUE_PORT";
pub const QUEUE_USER: &str = "QUEUE_USER";
pub const QUEUE_PASS: &str = "QUEUE_PASS";
pub const QUEUE_NAME: &str = "QUEUE_NAME";

pub const STORAGE_HOST: &str = "STORAGE_HOST";
pub const STORAGE_PORT: &str = "STORAGE_PORT";
pub const STORAGE_DB: &str = "STORAGE_DB";
pub const STORAGE_USER: &str = "STORAGE_USER";
pub const STORAGE_PASS: &str = "STORAGE_PASS";

/// Present only when the resource declares a bound; absence means unbounded.
pub const MAX_MESSAGES: &str = "MAX_MESSAGES";

/// Keys every referenced credential Secret must carry.
pub const SECRET_USERNAME_KEY: &str = "username";
pub const SECRET_PASSWORD_KEY: &str = "password";

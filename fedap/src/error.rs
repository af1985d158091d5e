/// Result type for the fedap crate's session and server entry points.
///
/// Failures that only affect one request have their own error types (see
/// [`crate::launch::LaunchError`]) and are answered on the wire; anything that ends a session or
/// a server is an `anyhow` error with context attached.
pub type Result<T> = anyhow::Result<T>;

use sysinfo::System;

/// Build a user agent of the form `product/version (os; os version)`.
///
/// Falls back to the compile-time OS name when the platform does not report
/// one.
pub fn create_user_agent_string(product: &str, version: &str) -> String {
    let os_name = System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
    match System::os_version() {
        Some(os_version) => format!("{product}/{version} ({os_name}; {os_version})"),
        None => format!("{product}/{version} ({os_name})"),
    }
}

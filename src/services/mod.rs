pub mod auth;
pub mod bus;
pub mod dispatch;
pub mod init;
pub mod providers;
pub mod retry;
pub mod selector;
pub mod sweeper;

/// Keep all but a short prefix of a recipient address out of log lines and
/// diagnostics.
pub fn mask_recipient(recipient: &str) -> String {
    match recipient.split_once('@') {
        Some((local, domain)) => {
            let prefix: String = local.chars().take(1).collect();
            format!("{}***@{}", prefix, domain)
        }
        None => {
            let len = recipient.chars().count();
            if len <= 2 {
                "***".to_string()
            } else {
                let suffix: String = recipient.chars().skip(len - 2).collect();
                format!("{}{}", "*".repeat(len - 2), suffix)
            }
        }
    }
}

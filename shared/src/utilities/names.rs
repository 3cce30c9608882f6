use sha2::{Digest, Sha256};

/// Kube resource names are DNS labels, at most this long.
pub const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Release names leave room for suffixes added by the chart.
pub const MAX_RELEASE_NAME_LEN: usize = 53;

const DIGEST_LEN: usize = 10;

/// Makes a string usable as a kube resource name: lowercased, every
/// character outside [a-z0-9-] replaced by a dash, edge dashes trimmed.
pub fn dns_label_safe(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mapped: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    mapped.trim_matches('-').to_string()
}

/// Caps `name` at `max` characters. Names over the cap keep a readable
/// prefix and gain a digest suffix so different long inputs cannot
/// collide after truncation. Deterministic for a given input.
pub fn truncated(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }

    let digest = hex::encode(Sha256::digest(name.as_bytes()));

    if max < DIGEST_LEN + 2 {
        return digest[..max.min(digest.len())].to_string();
    }

    let keep = max - DIGEST_LEN - 1;
    format!("{}-{}", &name[..keep], &digest[..DIGEST_LEN])
}

/// Joins the given parts into a deterministic, DNS-safe resource name no
/// longer than 63 characters.
pub fn generate_resource_name(parts: &[&str]) -> String {
    truncated(&dns_label_safe(&parts.join("-")), MAX_RESOURCE_NAME_LEN)
}

/// The release name used for an application's deployment.
pub fn release_name(app_name: &str) -> String {
    truncated(&dns_label_safe(app_name), MAX_RELEASE_NAME_LEN)
}

/// Name of the secret a bound service exposes its credentials under.
pub fn service_binding_resource(service_name: &str) -> String {
    generate_resource_name(&["s", service_name])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_label_safe() {
        assert_eq!(dns_label_safe("My App_1.2"), "my-app-1-2");
        assert_eq!(dns_label_safe("-edgy-"), "edgy");
        assert_eq!(dns_label_safe("plain"), "plain");
    }

    #[test]
    fn test_truncated_short_name_passes_through() {
        assert_eq!(truncated("short", 63), "short");
    }

    #[test]
    fn test_truncated_caps_length() {
        let long = "x".repeat(200);
        let name = truncated(&long, 63);
        assert_eq!(name.len(), 63);
    }

    #[test]
    fn test_truncated_is_deterministic() {
        let long = "an-application-with-a-very-unreasonably-long-name".repeat(3);
        assert_eq!(truncated(&long, 63), truncated(&long, 63));
    }

    #[test]
    fn test_truncated_distinguishes_long_names() {
        let prefix = "y".repeat(100);
        let a = truncated(&format!("{prefix}-alpha"), 63);
        let b = truncated(&format!("{prefix}-beta"), 63);
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_tiny_cap_falls_back_to_digest() {
        let long = "z".repeat(100);
        let name = truncated(&long, 8);
        assert_eq!(name.len(), 8);
    }

    #[test]
    fn test_generate_resource_name() {
        let name = generate_resource_name(&["stage", "workspace", "myapp", "deadbeef"]);
        assert_eq!(name, "stage-workspace-myapp-deadbeef");
        assert!(name.len() <= MAX_RESOURCE_NAME_LEN);
    }

    #[test]
    fn test_release_name_cap() {
        let name = release_name(&"application".repeat(10));
        assert!(name.len() <= MAX_RELEASE_NAME_LEN);
    }

    #[test]
    fn test_service_binding_resource() {
        assert_eq!(service_binding_resource("mydb"), "s-mydb");
    }
}

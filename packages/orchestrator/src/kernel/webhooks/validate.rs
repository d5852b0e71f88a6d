//! Event-type whitelist and repository name validation.

/// Event types the orchestrator acts on. Anything else is accepted with
/// `"ignored"` so the sender never sees 4xx noise for new event types.
pub const EVENT_WHITELIST: [&str; 10] = [
    "workflow_job",
    "workflow_run",
    "push",
    "pull_request",
    "check_run",
    "check_suite",
    "deployment",
    "release",
    "repository",
    "ping",
];

pub fn is_whitelisted(event_type: &str) -> bool {
    EVENT_WHITELIST.contains(&event_type)
}

const MAX_NAME_PART: usize = 39;

/// `owner/name`, each part non-empty, ≤ 39 chars, `[A-Za-z0-9-]` only.
/// The character class alone excludes traversal, URL schemes, and colons,
/// but the explicit rejections stay as a second fence.
pub fn is_valid_repository(full_name: &str) -> bool {
    if full_name.contains("..") || full_name.contains("://") || full_name.contains(':') {
        return false;
    }

    let mut parts = full_name.splitn(2, '/');
    let (Some(owner), Some(name)) = (parts.next(), parts.next()) else {
        return false;
    };

    for part in [owner, name] {
        if part.is_empty() || part.len() > MAX_NAME_PART {
            return false;
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_contains_workflow_events() {
        assert!(is_whitelisted("workflow_job"));
        assert!(is_whitelisted("ping"));
        assert!(!is_whitelisted("star"));
        assert!(!is_whitelisted(""));
    }

    #[test]
    fn ordinary_repositories_validate() {
        assert!(is_valid_repository("acme/widgets"));
        assert!(is_valid_repository("a/b"));
        assert!(is_valid_repository("my-org/my-repo-2"));
    }

    #[test]
    fn path_traversal_is_rejected() {
        assert!(!is_valid_repository("../evil/repo"));
        assert!(!is_valid_repository("a/.."));
        assert!(!is_valid_repository("a/b/../c"));
    }

    #[test]
    fn schemes_and_colons_are_rejected() {
        assert!(!is_valid_repository("https://evil/repo"));
        assert!(!is_valid_repository("owner/na:me"));
    }

    #[test]
    fn shape_violations_are_rejected() {
        assert!(!is_valid_repository("no-slash"));
        assert!(!is_valid_repository("/name"));
        assert!(!is_valid_repository("owner/"));
        assert!(!is_valid_repository("owner/name/extra"));
        assert!(!is_valid_repository("owner/na me"));
        assert!(!is_valid_repository("owner/na_me"));
    }

    #[test]
    fn overlong_parts_are_rejected() {
        let long = "a".repeat(40);
        assert!(!is_valid_repository(&format!("{long}/name")));
        assert!(is_valid_repository(&format!("{}/name", "a".repeat(39))));
    }
}

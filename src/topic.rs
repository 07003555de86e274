//! Channel descriptor parsing.
//!
//! Project channels carry a descriptor in their topic:
//! `<remote-vibe><directory>/abs/path</directory><app>APP_ID</app></remote-vibe>`
//! surrounded by arbitrary human text. Parsing is best-effort and never
//! fails; missing pieces come back as `None`.

/// Root tag of the channel descriptor.
pub const DESCRIPTOR_TAG: &str = "remote-vibe";

/// Parsed channel descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelTags {
    pub directory: Option<String>,
    pub app_id: Option<String>,
}

impl ChannelTags {
    /// Whether a channel with these tags belongs to the running app.
    /// A descriptor without an app tag is treated as owned.
    pub fn owned_by(&self, app_id: &str) -> bool {
        match &self.app_id {
            Some(tagged) => tagged == app_id,
            None => true,
        }
    }
}

/// Extract descriptor tags from a channel topic.
pub fn extract_tags(topic: &str) -> ChannelTags {
    let Some(body) = tag_body(topic, DESCRIPTOR_TAG) else {
        return ChannelTags::default();
    };
    ChannelTags {
        directory: tag_body(body, "directory").map(str::trim).map(str::to_owned),
        app_id: tag_body(body, "app").map(str::trim).map(str::to_owned),
    }
}

/// Render a descriptor back into topic form.
pub fn render_tags(directory: &str, app_id: &str) -> String {
    format!(
        "<{DESCRIPTOR_TAG}><directory>{directory}</directory><app>{app_id}</app></{DESCRIPTOR_TAG}>"
    )
}

fn tag_body<'a>(haystack: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = haystack.find(&open)? + open.len();
    let end = haystack[start..].find(&close)? + start;
    Some(&haystack[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_both_tags() {
        let topic =
            "<remote-vibe><directory>/home/u/proj</directory><app>123</app></remote-vibe>";
        let tags = extract_tags(topic);
        assert_eq!(tags.directory.as_deref(), Some("/home/u/proj"));
        assert_eq!(tags.app_id.as_deref(), Some("123"));
    }

    #[test]
    fn tolerates_surrounding_prose() {
        let topic = "Chat about the app! <remote-vibe><directory>/p</directory></remote-vibe> — be nice";
        let tags = extract_tags(topic);
        assert_eq!(tags.directory.as_deref(), Some("/p"));
        assert_eq!(tags.app_id, None);
    }

    #[test]
    fn missing_descriptor_yields_empty_tags() {
        assert_eq!(extract_tags("just a topic"), ChannelTags::default());
        assert_eq!(extract_tags(""), ChannelTags::default());
    }

    #[test]
    fn malformed_descriptor_is_silent() {
        let tags = extract_tags("<remote-vibe><directory>/p</app></remote-vibe>");
        assert_eq!(tags.directory, None);
        assert_eq!(tags.app_id, None);
    }

    #[test]
    fn round_trips_through_render() {
        let rendered = render_tags("/srv/code", "999");
        let tags = extract_tags(&rendered);
        assert_eq!(tags.directory.as_deref(), Some("/srv/code"));
        assert_eq!(tags.app_id.as_deref(), Some("999"));
        assert_eq!(extract_tags(&rendered), extract_tags(&rendered));
    }

    #[test]
    fn ownership_defaults_to_owned_without_app_tag() {
        let tags = extract_tags("<remote-vibe><directory>/p</directory></remote-vibe>");
        assert!(tags.owned_by("anything"));
        let tagged = extract_tags(&render_tags("/p", "42"));
        assert!(tagged.owned_by("42"));
        assert!(!tagged.owned_by("43"));
    }
}

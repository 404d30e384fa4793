//! Sparkle appcast parsing.
//!
//! Feeds in the wild are messy RSS: enclosures split across lines, version
//! attributes in either `sparkle:shortVersionString` or `sparkle:version`,
//! notes as an attribute or an item-level element. Parsed line-wise rather
//! than with a strict XML parser so malformed-but-common feeds still yield
//! their enclosures.

use crate::version;

/// One usable feed item.
#[derive(Debug, Clone, PartialEq)]
pub struct AppcastItem {
    pub version: String,
    pub download_url: Option<String>,
    pub release_notes_url: Option<String>,
    pub min_system_version: Option<String>,
}

/// Substrings that mark a version or title as a pre-release.
const PRE_RELEASE_INDICATORS: &[&str] =
    &["beta", "alpha", "rc", "dev", "pre", "nightly", "canary"];

fn is_pre_release(version: &str) -> bool {
    let lower = version.to_lowercase();
    PRE_RELEASE_INDICATORS.iter().any(|ind| lower.contains(ind))
}

/// Pick the best item: highest version strictly newer than `installed`,
/// excluding pre-releases and items whose minimum system version exceeds
/// `host_os_version` (when both are known).
pub fn best_item(
    xml: &str,
    installed: Option<&str>,
    host_os_version: Option<&str>,
) -> Option<AppcastItem> {
    let mut best: Option<AppcastItem> = None;

    for item in parse_items(xml) {
        if is_pre_release(&item.version) {
            continue;
        }
        if let (Some(min), Some(host)) = (item.min_system_version.as_deref(), host_os_version) {
            if version::is_newer(host, min) {
                continue;
            }
        }
        if let Some(installed) = installed {
            if !version::is_newer(installed, &item.version) {
                continue;
            }
        }
        match &best {
            Some(existing) if !version::is_newer(&existing.version, &item.version) => {}
            _ => best = Some(item),
        }
    }

    best
}

/// All enclosure-bearing items in feed order.
pub fn parse_items(xml: &str) -> Vec<AppcastItem> {
    let blocks = collect_enclosure_blocks(xml);
    let notes_links = collect_release_notes_links(xml);

    let mut items = Vec::new();
    for (idx, block) in blocks.iter().enumerate() {
        let short_ver = extract_attr(block, "sparkle:shortVersionString")
            .or_else(|| extract_attr(block, "sparkle:version"));
        let version = match short_ver {
            Some(v) if !v.is_empty() => v,
            _ => continue,
        };

        let release_notes_url = extract_attr(block, "sparkle:releaseNotesLink")
            .or_else(|| notes_links.get(idx).cloned().flatten());

        items.push(AppcastItem {
            version,
            download_url: extract_attr(block, "url"),
            release_notes_url,
            min_system_version: extract_attr(block, "sparkle:minimumSystemVersion"),
        });
    }
    items
}

/// Collects `<enclosure ...>` blocks, handling elements that span lines.
fn collect_enclosure_blocks(xml: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in xml.lines() {
        if let Some(ref mut block) = current {
            block.push(' ');
            block.push_str(line.trim());
            if line.contains("/>") || line.contains('>') {
                blocks.push(block.clone());
                current = None;
            }
        } else if let Some(start) = line.find("<enclosure") {
            let rest = &line[start..];
            if rest.contains("/>") || (rest.contains('>') && rest.contains("url")) {
                blocks.push(rest.to_string());
            } else {
                current = Some(rest.to_string());
            }
        }
    }
    blocks
}

/// `<sparkle:releaseNotesLink>` URLs per `<item>` block, index-aligned with
/// enclosure order.
fn collect_release_notes_links(xml: &str) -> Vec<Option<String>> {
    let mut links = Vec::new();
    let mut in_item = false;
    let mut current: Option<String> = None;

    for line in xml.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("<item") {
            in_item = true;
            current = None;
        } else if trimmed == "</item>" {
            if in_item {
                links.push(current.take());
            }
            in_item = false;
        } else if in_item && current.is_none() {
            if let Some(start) = trimmed.find("<sparkle:releaseNotesLink>") {
                let after = &trimmed[start + "<sparkle:releaseNotesLink>".len()..];
                if let Some(end) = after.find("</sparkle:releaseNotesLink>") {
                    let url = after[..end].trim().to_string();
                    if !url.is_empty() {
                        current = Some(url);
                    }
                }
            }
        }
    }
    links
}

fn extract_attr(text: &str, attr: &str) -> Option<String> {
    let pattern = format!("{attr}=\"");
    let start = text.find(&pattern)?;
    let after = &text[start + pattern.len()..];
    let end = after.find('"')?;
    Some(after[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rss xmlns:sparkle="http://www.andymatuschak.org/xml-namespaces/sparkle" version="2.0">
  <channel>
    <title>Example App</title>
    <item>
      <title>Version 1.5.2</title>
      <sparkle:releaseNotesLink>https://example.com/notes/1.5.2.html</sparkle:releaseNotesLink>
      <enclosure url="https://example.com/app-1.5.2.dmg"
                 sparkle:shortVersionString="1.5.2"
                 sparkle:version="1520"
                 sparkle:minimumSystemVersion="12.0"
                 length="1000" type="application/octet-stream"/>
    </item>
    <item>
      <title>Version 1.5.0</title>
      <enclosure url="https://example.com/app-1.5.0.dmg" sparkle:shortVersionString="1.5.0" length="900" type="application/octet-stream"/>
    </item>
    <item>
      <title>Version 2.0-beta.1</title>
      <enclosure url="https://example.com/app-2.0b1.dmg" sparkle:shortVersionString="2.0-beta.1" length="1100" type="application/octet-stream"/>
    </item>
  </channel>
</rss>
"#;

    #[test]
    fn parses_all_enclosures_in_order() {
        let items = parse_items(FEED);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].version, "1.5.2");
        assert_eq!(
            items[0].download_url.as_deref(),
            Some("https://example.com/app-1.5.2.dmg")
        );
        assert_eq!(
            items[0].release_notes_url.as_deref(),
            Some("https://example.com/notes/1.5.2.html")
        );
        assert_eq!(items[0].min_system_version.as_deref(), Some("12.0"));
    }

    #[test]
    fn best_item_skips_pre_releases_and_old_versions() {
        let item = best_item(FEED, Some("1.5.0"), Some("14.2")).unwrap();
        assert_eq!(item.version, "1.5.2");
    }

    #[test]
    fn best_item_none_when_up_to_date() {
        assert!(best_item(FEED, Some("1.5.2"), Some("14.2")).is_none());
    }

    #[test]
    fn best_item_respects_minimum_system_version() {
        // Host on 11.x cannot take the 12.0-minimum build.
        assert!(best_item(FEED, Some("1.4.0"), Some("11.6")).is_some());
        let item = best_item(FEED, Some("1.4.0"), Some("11.6")).unwrap();
        assert_eq!(item.version, "1.5.0");
    }

    #[test]
    fn multiline_enclosures_are_collected() {
        let xml = r#"
<item>
<enclosure
    url="https://example.com/app.zip"
    sparkle:shortVersionString="3.1"
/>
</item>
"#;
        let items = parse_items(xml);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].version, "3.1");
        assert_eq!(
            items[0].download_url.as_deref(),
            Some("https://example.com/app.zip")
        );
    }

    #[test]
    fn falls_back_to_sparkle_version_attr() {
        let xml = r#"<enclosure url="https://x.test/a.dmg" sparkle:version="451" length="1"/>"#;
        let items = parse_items(xml);
        assert_eq!(items[0].version, "451");
    }
}

//! Debuggable targets as listed by the endpoint's `/json` discovery route.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTarget {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

impl RemoteTarget {
    pub fn is_page(&self) -> bool {
        self.kind == "page"
    }

    pub fn is_attachable(&self) -> bool {
        self.web_socket_debugger_url
            .as_deref()
            .is_some_and(|url| !url.is_empty())
    }
}

/// Lower is better. URL match beats a titled page beats any page.
pub fn target_rank(target: &RemoteTarget, url_pattern: &str) -> u8 {
    if !url_pattern.is_empty() && target.url.contains(url_pattern) {
        0
    } else if target.is_page() && has_view_title(target) {
        1
    } else if target.is_page() {
        2
    } else {
        9
    }
}

/// A real view title; shells that never set one report the document name.
fn has_view_title(target: &RemoteTarget) -> bool {
    let title = target.title.trim();
    !title.is_empty() && title != "index.html"
}

/// Attachable targets, best first. The endpoint lists targets newest first,
/// so the sort is stable and ties keep list order.
pub fn rank_targets(targets: Vec<RemoteTarget>, url_pattern: &str) -> Vec<RemoteTarget> {
    let mut ranked: Vec<(u8, RemoteTarget)> = targets
        .into_iter()
        .filter(RemoteTarget::is_attachable)
        .map(|t| (target_rank(&t, url_pattern), t))
        .collect();
    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().map(|(_, t)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, kind: &str, title: &str, url: &str) -> RemoteTarget {
        RemoteTarget {
            id: id.into(),
            kind: kind.into(),
            title: title.into(),
            url: url.into(),
            web_socket_debugger_url: Some(format!("ws://127.0.0.1:9222/devtools/page/{id}")),
        }
    }

    #[test]
    fn parses_discovery_listing() {
        let raw = r#"[{
            "description": "", "id": "A1", "title": "IM", "type": "page",
            "url": "app://im-view/index.html",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/A1"
        }]"#;
        let targets: Vec<RemoteTarget> = serde_json::from_str(raw).expect("parse");
        assert_eq!(targets[0].kind, "page");
        assert!(targets[0].is_attachable());
    }

    #[test]
    fn pattern_match_ranks_first() {
        let ranked = rank_targets(
            vec![
                target("w", "service_worker", "", "app://sw.js"),
                target("p", "page", "", "app://blank"),
                target("t", "page", "Settings", "app://settings"),
                target("im", "page", "", "app://im-view/index.html"),
            ],
            "im-view",
        );
        let ids: Vec<&str> = ranked.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["im", "t", "p", "w"]);
    }

    #[test]
    fn ties_keep_listing_order() {
        let ranked = rank_targets(
            vec![
                target("newest", "page", "", "app://im-view/a"),
                target("older", "page", "", "app://im-view/b"),
            ],
            "im-view",
        );
        assert_eq!(ranked[0].id, "newest");
        assert_eq!(ranked[1].id, "older");
    }

    #[test]
    fn document_name_title_is_not_a_view_title() {
        let shell = target("shell", "page", "index.html", "app://main");
        let named = target("named", "page", "Contacts", "app://contacts");
        assert_eq!(target_rank(&shell, "im-view"), 2);
        assert_eq!(target_rank(&named, "im-view"), 1);
        let ranked = rank_targets(vec![shell, named], "im-view");
        assert_eq!(ranked[0].id, "named");
    }

    #[test]
    fn unattachable_targets_dropped() {
        let mut t = target("x", "page", "IM", "app://im-view");
        t.web_socket_debugger_url = None;
        assert!(rank_targets(vec![t], "im-view").is_empty());
    }
}

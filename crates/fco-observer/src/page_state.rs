//! Page State
//!
//! Classification flags for the current page, recomputed on navigation and
//! read by subscription matching (`page_types` gates).

use std::collections::BTreeMap;

use fco_dom::{Selector, TreeAccess, Viewport, descendants, has_matching_descendant};
use serde::{Deserialize, Serialize};

/// Page kinds a subscription can be gated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Home,
    Forum,
    Thread,
    Profile,
    Search,
    Messages,
    Editor,
}

impl PageType {
    pub const ALL: [PageType; 7] = [
        PageType::Home,
        PageType::Forum,
        PageType::Thread,
        PageType::Profile,
        PageType::Search,
        PageType::Messages,
        PageType::Editor,
    ];
}

/// Current location (path plus raw query string)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub query: String,
}

impl Location {
    /// Split `"/showthread.php?t=10"` into path and query
    pub fn parse(url: &str) -> Self {
        // Drop scheme and host if present
        let rest = match url.find("://") {
            Some(pos) => {
                let after = &url[pos + 3..];
                after.find('/').map(|i| &after[i..]).unwrap_or("/")
            }
            None => url,
        };
        let rest = rest.split('#').next().unwrap_or("");
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        Self {
            path: if path.is_empty() { "/".into() } else { path.to_ascii_lowercase() },
            query: query.to_string(),
        }
    }
}

/// Rules used to build a [`PageState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRules {
    /// Exact paths of the board index
    pub home_paths: Vec<String>,
    /// Path fragments identifying each page type
    pub path_markers: BTreeMap<PageType, Vec<String>>,
    /// Matches the document element or body when a dark theme is active
    pub dark_theme_selector: String,
    /// Present somewhere in the page when the visitor is logged in
    pub logged_in_selector: String,
    /// Viewport widths below this count as mobile
    pub mobile_breakpoint: f32,
    /// Depth limit for the logged-in probe
    pub probe_depth: usize,
}

impl Default for PageRules {
    fn default() -> Self {
        let markers = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let path_markers = BTreeMap::from([
            (PageType::Forum, markers(&["forumdisplay", "/forums/", "/board/"])),
            (PageType::Thread, markers(&["showthread", "/threads/", "/topic/", "showpost"])),
            (PageType::Profile, markers(&["member.php", "/members/", "/profile"])),
            (PageType::Search, markers(&["search.php", "/search"])),
            (PageType::Messages, markers(&["private.php", "/conversations", "/messages"])),
            (PageType::Editor, markers(&["newreply", "newthread", "editpost", "/post-thread"])),
        ]);
        Self {
            home_paths: markers(&["/", "/index.php", "/forum.php"]),
            path_markers,
            dark_theme_selector: "[data-theme=dark], .theme-dark, .dark-mode".into(),
            logged_in_selector: "#usercp, .logged-in, a[href*='logout']".into(),
            mobile_breakpoint: 768.0,
            probe_depth: 12,
        }
    }
}

/// Snapshot of page classification flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageState {
    pub home: bool,
    pub forum: bool,
    pub thread: bool,
    pub profile: bool,
    pub search: bool,
    pub messages: bool,
    pub editor: bool,
    pub dark_theme: bool,
    pub logged_in: bool,
    pub mobile: bool,
}

impl PageState {
    /// Classify the page from its location, markup and viewport
    pub fn snapshot<T: TreeAccess + ?Sized>(
        location: &Location,
        tree: &T,
        viewport: Viewport,
        rules: &PageRules,
    ) -> Self {
        let mut state = PageState {
            home: rules.home_paths.iter().any(|p| p.eq_ignore_ascii_case(&location.path)),
            ..PageState::default()
        };

        for (page_type, markers) in &rules.path_markers {
            let hit = markers
                .iter()
                .any(|m| location.path.contains(&m.to_ascii_lowercase()));
            state.set(*page_type, hit);
        }

        let root = tree.root();
        if let Some(theme) = parse_rule(&rules.dark_theme_selector) {
            // Theme markers live on <html> or <body>
            state.dark_theme = descendants(tree, root, 2)
                .into_iter()
                .any(|node| theme.matches(tree, node));
        }
        if let Some(login) = parse_rule(&rules.logged_in_selector) {
            state.logged_in = has_matching_descendant(tree, root, &login, rules.probe_depth);
        }
        state.mobile = viewport.width < rules.mobile_breakpoint;

        tracing::debug!(?state, path = %location.path, "page state recomputed");
        state
    }

    /// Is the page of the given type?
    pub fn is(&self, page_type: PageType) -> bool {
        match page_type {
            PageType::Home => self.home,
            PageType::Forum => self.forum,
            PageType::Thread => self.thread,
            PageType::Profile => self.profile,
            PageType::Search => self.search,
            PageType::Messages => self.messages,
            PageType::Editor => self.editor,
        }
    }

    fn set(&mut self, page_type: PageType, value: bool) {
        let flag = match page_type {
            PageType::Home => &mut self.home,
            PageType::Forum => &mut self.forum,
            PageType::Thread => &mut self.thread,
            PageType::Profile => &mut self.profile,
            PageType::Search => &mut self.search,
            PageType::Messages => &mut self.messages,
            PageType::Editor => &mut self.editor,
        };
        *flag = value;
    }

    /// Empty gate passes; otherwise at least one listed type must hold
    pub fn satisfies(&self, page_types: &[PageType]) -> bool {
        page_types.is_empty() || page_types.iter().any(|&t| self.is(t))
    }
}

fn parse_rule(text: &str) -> Option<Selector> {
    if text.trim().is_empty() {
        return None;
    }
    match Selector::parse(text) {
        Ok(selector) => Some(selector),
        Err(err) => {
            tracing::warn!(%err, "ignoring page rule");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fco_dom::DomTree;

    fn page() -> DomTree {
        let mut tree = DomTree::new();
        let root = tree.root();
        let html = tree.append_element(root, "html", &[("data-theme", "dark")]).unwrap();
        let body = tree.append_element(html, "body", &[]).unwrap();
        let nav = tree.append_element(body, "div", &[("class", "navbar")]).unwrap();
        tree.append_element(nav, "a", &[("href", "login.php?do=logout")]).unwrap();
        tree
    }

    #[test]
    fn test_location_parse() {
        let loc = Location::parse("https://forum.example.org/ShowThread.php?t=42#post7");
        assert_eq!(loc.path, "/showthread.php");
        assert_eq!(loc.query, "t=42");
        assert_eq!(Location::parse("https://forum.example.org").path, "/");
    }

    #[test]
    fn test_thread_page_snapshot() {
        let tree = page();
        let state = PageState::snapshot(
            &Location::parse("/showthread.php?t=1"),
            &tree,
            Viewport::new(0.0, 0.0, 1280.0, 800.0),
            &PageRules::default(),
        );
        assert!(state.thread);
        assert!(!state.home);
        assert!(state.dark_theme);
        assert!(state.logged_in);
        assert!(!state.mobile);

        assert!(state.satisfies(&[]));
        assert!(state.satisfies(&[PageType::Forum, PageType::Thread]));
        assert!(!state.satisfies(&[PageType::Profile]));
    }

    #[test]
    fn test_home_and_mobile() {
        let tree = DomTree::new();
        let state = PageState::snapshot(
            &Location::parse("/index.php"),
            &tree,
            Viewport::new(0.0, 0.0, 390.0, 844.0),
            &PageRules::default(),
        );
        assert!(state.home);
        assert!(state.mobile);
        assert!(!state.dark_theme);
        assert!(!state.logged_in);
    }
}

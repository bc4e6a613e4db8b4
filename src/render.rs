//! HTML rendering of directory listings

use crate::listing::DirectoryListing;
use crate::resolver::FILES_PREFIX;
use html_escape::{encode_double_quoted_attribute, encode_text};
use std::fmt::Write;
use std::path::PathBuf;

/// Answers "is the child named X of the listed directory a directory?"
pub trait EntryClassifier {
    fn is_dir(&self, name: &str) -> bool;
}

/// Classifies entries by statting them on disk at render time
#[derive(Debug, Clone)]
pub struct DirectoryProbe {
    dir: PathBuf,
}

impl DirectoryProbe {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl EntryClassifier for DirectoryProbe {
    fn is_dir(&self, name: &str) -> bool {
        std::fs::metadata(self.dir.join(name))
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

/// Classifies entries from the flags recorded while listing
impl EntryClassifier for DirectoryListing {
    fn is_dir(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.name == name && e.is_directory)
    }
}

const FOLDER_ICON: &str = r#"<svg class="icon" viewBox="0 0 24 24" fill="none" stroke="currentColor" stroke-width="2" stroke-linecap="round" stroke-linejoin="round"><path d="M3 6h18a2 2 0 0 1 2 2v12a2 2 0 0 1-2 2H3a2 2 0 0 1-2-2V8a2 2 0 0 1 2-2z"></path><path d="M3 6l3-3h6l3 3"></path></svg>"#;

const FILE_ICON: &str = r#"<svg class="icon" viewBox="0 0 24 24" fill="none" stroke="currentColor" stroke-width="2" stroke-linecap="round" stroke-linejoin="round"><path d="M6 2h8l6 6v12a2 2 0 0 1-2 2H6a2 2 0 0 1-2-2V4a2 2 0 0 1 2-2z"></path><path d="M14 2v6h6"></path></svg>"#;

const BACK_ICON: &str = r#"<svg class="icon" viewBox="0 0 24 24" fill="none" stroke="currentColor" stroke-width="2" stroke-linecap="round" stroke-linejoin="round"><polyline points="15 18 9 12 15 6"></polyline></svg>"#;

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Escudeiro</title>
<style>
:root { --bg: #f8f9fa; --panel: #fff; --text: #000; --border: #000; --hover: #f1f1f1; }
.dark-mode { --bg: #121212; --panel: #1e1e1e; --text: #fff; --border: #fff; --hover: #2c2c2c; }
* { margin: 0; padding: 0; box-sizing: border-box; font-family: Arial, sans-serif; }
body { background: var(--bg); color: var(--text); display: flex; flex-direction: column; align-items: center; min-height: 100vh; padding: 40px; transition: background 0.3s, color 0.3s; }
.container { width: 100%; max-width: 900px; background: var(--panel); border: 2px solid var(--border); padding: 20px; border-radius: 8px; box-shadow: 0 4px 8px rgba(0, 0, 0, 0.1); }
h2 { font-size: 24px; margin-bottom: 20px; }
.back-link { display: flex; align-items: center; font-size: 18px; font-weight: bold; margin-bottom: 15px; }
ul { list-style: none; width: 100%; }
li { display: flex; align-items: center; padding: 12px; border-top: 1px solid var(--border); transition: background 0.3s ease; }
li:hover { background: var(--hover); }
a { text-decoration: none; color: var(--text); font-size: 18px; display: flex; align-items: center; width: 100%; }
.icon { width: 24px; height: 24px; margin-right: 10px; }
.theme-toggle { position: fixed; top: 10px; right: 10px; background: none; border: 2px solid var(--text); color: var(--text); padding: 5px 12px; font-size: 14px; cursor: pointer; border-radius: 4px; }
.theme-toggle:hover { background: var(--text); color: var(--panel); }
</style>
</head>
<body>
<button class="theme-toggle" onclick="toggleTheme()">Dark mode</button>
<div class="container">
<h2>Escudeiro</h2>
"#;

const PAGE_TAIL: &str = r#"</div>
<script>
document.addEventListener("DOMContentLoaded", function () {
  if (localStorage.getItem("theme") === "dark") {
    document.body.classList.add("dark-mode");
    document.querySelector(".theme-toggle").innerText = "Light mode";
  }
});
function toggleTheme() {
  var dark = document.body.classList.toggle("dark-mode");
  document.querySelector(".theme-toggle").innerText = dark ? "Light mode" : "Dark mode";
  localStorage.setItem("theme", dark ? "dark" : "light");
}
</script>
</body>
</html>
"#;

/// Render a listing as a complete HTML document.
///
/// Directories link relatively to `{name}/` so browsing stays on the listing
/// endpoint; files link to `/files/{current}{name}` so they go through the
/// PHP and static-file handlers.
pub fn render_listing(listing: &DirectoryListing, classifier: &dyn EntryClassifier) -> String {
    let mut html = String::with_capacity(PAGE_HEAD.len() + PAGE_TAIL.len() + listing.entries.len() * 512);
    html.push_str(PAGE_HEAD);

    if !listing.current_relative_path.is_empty() {
        let _ = writeln!(
            html,
            r#"<a href="../" class="back-link">{}{}</a>"#,
            BACK_ICON,
            encode_text(&format!("/{}", listing.current_relative_path))
        );
    }

    html.push_str("<ul>\n");
    for name in listing.names() {
        let (href, icon, target) = if classifier.is_dir(name) {
            (format!("{}/", encode_segment(name)), FOLDER_ICON, "")
        } else {
            (file_href(&listing.current_relative_path, name), FILE_ICON, r#" target="_blank""#)
        };
        let _ = writeln!(
            html,
            r#"<li><a href="{}"{}>{}{}</a></li>"#,
            encode_double_quoted_attribute(&href),
            target,
            icon,
            encode_text(name)
        );
    }
    html.push_str("</ul>\n");

    html.push_str(PAGE_TAIL);
    html
}

/// Absolute link to a file through the explicit file endpoint
pub fn file_href(current_relative_path: &str, name: &str) -> String {
    let mut href = String::from(FILES_PREFIX);
    for segment in current_relative_path.split('/').filter(|s| !s.is_empty()) {
        href.push_str(&encode_segment(segment));
        href.push('/');
    }
    href.push_str(&encode_segment(name));
    href
}

fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

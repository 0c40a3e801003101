//! Apache-style `index.html` listing written into each mirror directory so
//! the static site can be browsed like an autoindexed web server.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

pub const PAGE_FILE: &str = "index.html";

#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn size_label(size: u64) -> String {
    let kb = (size as f64 / 1024.0).round().max(1.0) as u64;
    format!("{kb} KB")
}

/// Renders the listing page. Entries are sorted directories first, then by
/// case-insensitive name; an existing `index.html` entry is left out.
pub fn render(addon_id: &str, entries: &[ListingEntry]) -> String {
    let mut sorted: Vec<&ListingEntry> = entries.iter().filter(|e| e.name != PAGE_FILE).collect();
    sorted.sort_by_key(|e| (!e.is_dir, e.name.to_lowercase()));

    let mut rows = vec![
        "      <tr><td><a href=\"../\">Parent Directory</a></td><td align=\"right\">-</td><td align=\"right\">-</td></tr>"
            .to_string(),
    ];
    for entry in sorted {
        let (href, size) = if entry.is_dir {
            (format!("{}/", entry.name), "-".to_string())
        } else {
            (entry.name.clone(), size_label(entry.size))
        };
        let href = escape(&href);
        rows.push(format!(
            "      <tr><td><a href=\"{href}\">{href}</a></td><td align=\"right\">{}</td><td align=\"right\">{size}</td></tr>",
            entry.modified.format("%d-%b-%Y")
        ));
    }

    let title = escape(&format!("/repo/{addon_id}/"));
    format!(
        r#"<html>
<head>
<title>{title}</title>
<link rel="stylesheet" href="/assets/css/style.css" media="screen" type="text/css"/>
<link rel="stylesheet" href="/assets/css/print.css" media="print" type="text/css"/>
<meta name="description" content="{title}"/>
</head>
<body>
  <h2>Index of {title}</h2>
  <table>
    <tbody>
      <tr><th>Name</th><th>Last modified</th><th>Size</th></tr>
      <tr><th colspan="3"><hr></th></tr>
{rows}
    </tbody>
  </table>
</body>
</html>
"#,
        rows = rows.join("\n")
    )
}

/// Lists `dir` and writes its `index.html`.
pub fn write(dir: &Path, addon_id: &str) -> io::Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push(ListingEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified: DateTime::<Utc>::from(modified),
        });
    }
    fs::write(dir.join(PAGE_FILE), render(addon_id, &entries))
}

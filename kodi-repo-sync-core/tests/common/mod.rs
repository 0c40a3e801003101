#![allow(dead_code)]

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub fn addon_xml(id: &str, version: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<addon id=\"{id}\" version=\"{version}\" name=\"{id}\" provider-name=\"tests\">\n  <extension point=\"xbmc.addon.repository\"/>\n</addon>\n"
    )
}

/// A release zip laid out the way Kodi packages are: everything under `<id>/`.
pub fn addon_zip(id: &str, version: &str) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let files = [
        (format!("{id}/addon.xml"), addon_xml(id, version).into_bytes()),
        (format!("{id}/icon.png"), format!("icon {version}").into_bytes()),
    ];
    for (name, data) in files {
        writer.start_file(name, options).unwrap();
        writer.write_all(&data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Places a first-party add-on folder directly in the repository.
pub fn first_party(repo: &Path, id: &str, version: &str) {
    let dir = repo.join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("addon.xml"), addon_xml(id, version)).unwrap();
}

/// Every regular file under `root` with its bytes, sorted by path.
pub fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let bytes = fs::read(&path).unwrap();
                files.push((path.strip_prefix(root).unwrap().to_path_buf(), bytes));
            }
        }
    }
    files.sort();
    files
}

pub fn zips_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".zip"))
        .collect();
    names.sort();
    names
}

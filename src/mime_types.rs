//! Media-type ↔ filename-extension mapping
//!
//! A somewhat-arbitrary selection of the most important standard mime types
//! for use with net apps. Excludes all non-standard or vendor-specific types
//! and most non-document types. Should generally be supplemented by your
//! /etc/mime.types file, especially if you plan to store audio, video, or
//! animation files or source documents from word processors & spreadsheets.
//!
//! The table is built once at startup and treated as immutable afterwards, so
//! readers share it without locks.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const BUILTIN_TYPES: &[(&str, &str)] = &[
	(".css", "text/css"),
	(".csv", "text/csv"),
	(".eml", "message/rfc822"),
	(".gif", "image/gif"),
	// strictly speaking under MIME gzip would only be used as an encoding,
	// not a content-type, but it's common to have .gz files
	(".gz", "application/gzip"),
	(".htm", "text/html"),
	(".html", "text/html"),
	(".jpg", "image/jpeg"),
	(".jpeg", "image/jpeg"),
	(".js", "application/javascript"),
	(".json", "application/json"),
	(".pdf", "application/pdf"),
	(".png", "image/png"),
	(".svg", "image/svg+xml"),
	(".tar", "application/tar"),
	(".txt", "text/plain"),
	(".tsv", "text/tab-separated-values"),
	(".xhtml", "application/xhtml+xml"),
	(".xml", "text/xml"),
	(".xsl", "text/xml"),
	(".xsd", "text/xml"),
	(".zip", "application/zip"),
];

const BUILTIN_EXTENSIONS: &[(&str, &str)] = &[
	("application/pdf", ".pdf"),
	("application/javascript", ".js"),
	("application/x-javascript", ".js"),
	("application/json", ".json"),
	("application/gzip", ".gz"),
	("application/x-gzip", ".gz"),
	("application/tar", ".tar"),
	("application/xhtml+xml", ".xhtml"),
	("application/zip", ".zip"),
	("image/gif", ".gif"),
	("image/jpeg", ".jpg"),
	("image/png", ".png"),
	("image/svg+xml", ".svg"),
	("message/rfc822", ".eml"),
	("text/comma-separated-values", ".csv"),
	("text/css", ".css"),
	("text/csv", ".csv"),
	("text/html", ".html"),
	("text/plain", ".txt"),
	("text/tab-separated-values", ".tsv"),
	("text/xml", ".xml"),
];

/// Bidirectional media-type/extension table
#[derive(Debug)]
pub struct MimeTable {
	types: HashMap<String, String>,
	extensions: HashMap<String, String>,
}

impl MimeTable {
	/// Build the table from the built-in catalog
	pub fn new() -> Self {
		let mut table = MimeTable { types: HashMap::new(), extensions: HashMap::new() };
		// built-in entries take the text/* charset default through the same
		// helper as mime.types-loaded ones
		for (ext, typ) in BUILTIN_TYPES {
			table.set_extension_type(ext, typ);
		}
		for (typ, ext) in BUILTIN_EXTENSIONS {
			table.set_type_extension(typ, ext);
		}
		table
	}

	/// Augment the table from a UNIX mime.types file.
	///
	/// Lines are whitespace-separated `type ext ext ...`; `#` starts a
	/// comment. Missing or unreadable files are ignored, matching the
	/// behaviour of serving hosts without the file installed.
	pub fn load_mime_file(&mut self, path: &Path) {
		let file = match File::open(path) {
			Ok(f) => f,
			Err(_) => return,
		};

		for line in BufReader::new(file).lines() {
			let line = match line {
				Ok(l) => l,
				Err(_) => return,
			};
			let fields: Vec<&str> = line.split_whitespace().collect();
			if fields.len() <= 1 || fields[0].starts_with('#') {
				continue;
			}
			let mime_type = fields[0];
			if !fields[1].starts_with('#') {
				self.set_type_extension(mime_type, &format!(".{}", fields[1]));
			}
			for ext in &fields[1..] {
				if ext.starts_with('#') {
					break;
				}
				self.set_extension_type(&format!(".{}", ext), mime_type);
			}
		}
	}

	/// The MIME type associated with the file extension `ext` (leading dot
	/// included, as in `.html`), or `""` when there is no mapping.
	///
	/// Text types carry a `charset=utf-8` parameter by default.
	pub fn type_by_extension(&self, ext: &str) -> &str {
		self.types.get(ext).map(String::as_str).unwrap_or("")
	}

	/// The extension associated with the MIME type `typ` (leading dot
	/// included), or `""` when there is no mapping. Case-sensitive.
	pub fn extension_by_type(&self, typ: &str) -> &str {
		self.extensions.get(typ).map(String::as_str).unwrap_or("")
	}

	fn set_extension_type(&mut self, extension: &str, mime_type: &str) {
		let mut stored = mime_type.to_string();
		if mime_type.starts_with("text/") && !mime_type.contains("charset=") {
			stored.push_str("; charset=utf-8");
		}
		self.types.insert(extension.to_string(), stored);
	}

	fn set_type_extension(&mut self, mime_type: &str, extension: &str) {
		self.extensions.insert(mime_type.to_string(), extension.to_string());
	}
}

impl Default for MimeTable {
	fn default() -> Self {
		Self::new()
	}
}


// vim: ts=4

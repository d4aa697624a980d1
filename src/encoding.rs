//! Content-encoding support for request bodies and on-disk blobs
//!
//! Only the identity and gzip encodings are supported; anything else is
//! rejected before the upload pipeline touches the stream.

use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::VermError;

/// The transfer/storage encodings this store understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
	Identity,
	Gzip,
}

impl ContentEncoding {
	/// Parse a `Content-Encoding` header value; an absent or empty header
	/// means identity
	pub fn parse(value: &str) -> Result<Self, VermError> {
		match value {
			"" => Ok(ContentEncoding::Identity),
			"gzip" => Ok(ContentEncoding::Gzip),
			other => Err(VermError::UnsupportedEncoding { encoding: other.to_string() }),
		}
	}

	/// Filename suffix for a blob stored in this encoding
	pub fn suffix(self) -> &'static str {
		match self {
			ContentEncoding::Identity => "",
			ContentEncoding::Gzip => ".gz",
		}
	}

	pub fn is_identity(self) -> bool {
		self == ContentEncoding::Identity
	}

	/// Wrap a reader so it yields the decoded byte stream
	pub fn decoder<'a, R: Read + 'a>(self, input: R) -> Box<dyn Read + 'a> {
		match self {
			ContentEncoding::Identity => Box::new(input),
			ContentEncoding::Gzip => Box::new(GzDecoder::new(input)),
		}
	}
}


// vim: ts=4

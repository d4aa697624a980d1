//! Error types for verm operations

use std::error::Error;
use std::fmt;
use std::io;

/// Main error type for the upload and serving paths
///
/// Every variant maps to exactly one HTTP status code via [`VermError::status_code`],
/// so handlers can surface errors without per-site match arms.
#[derive(Debug)]
pub enum VermError {
	/// Content-Encoding other than identity or gzip
	UnsupportedEncoding { encoding: String },

	/// Malformed gzip in a request body or stored file
	DecodeFailure { message: String },

	/// A replicated PUT's path disagrees with the recomputed hash location
	WrongLocation { location: String },

	/// Transport error while reading the request body
	ReadBodyFailure { message: String },

	/// Cannot create a directory, tempfile, or link, or stat a file
	Filesystem(io::Error),

	/// The file is absent locally and on all peers (or forwarding was disabled)
	NotFound,

	/// Verb outside GET/HEAD/POST/PUT
	MethodNotSupported,
}

impl VermError {
	/// The HTTP status this error surfaces as
	pub fn status_code(&self) -> u16 {
		match self {
			VermError::UnsupportedEncoding { .. } => 400,
			VermError::DecodeFailure { .. } => 500,
			VermError::WrongLocation { .. } => 422,
			VermError::ReadBodyFailure { .. } => 500,
			VermError::Filesystem(_) => 500,
			VermError::NotFound => 404,
			VermError::MethodNotSupported => 405,
		}
	}
}

impl fmt::Display for VermError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			VermError::UnsupportedEncoding { encoding } => {
				write!(f, "Don't know how to decode {}", encoding)
			}
			VermError::DecodeFailure { message } => {
				write!(f, "Couldn't decompress stream: {}", message)
			}
			VermError::WrongLocation { location } => {
				write!(f, "{} is not the correct location, is the file corrupt?", location)
			}
			VermError::ReadBodyFailure { message } => {
				write!(f, "Couldn't read request body: {}", message)
			}
			VermError::Filesystem(e) => write!(f, "Filesystem error: {}", e),
			VermError::NotFound => write!(f, "File not found"),
			VermError::MethodNotSupported => write!(f, "Method not supported"),
		}
	}
}

impl Error for VermError {}

impl From<io::Error> for VermError {
	fn from(e: io::Error) -> Self {
		// flate2 reports malformed input through io::Error with InvalidInput/InvalidData
		match e.kind() {
			io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
				VermError::DecodeFailure { message: e.to_string() }
			}
			_ => VermError::Filesystem(e),
		}
	}
}

impl From<axum::Error> for VermError {
	fn from(e: axum::Error) -> Self {
		VermError::ReadBodyFailure { message: e.to_string() }
	}
}

impl From<axum::extract::multipart::MultipartError> for VermError {
	fn from(e: axum::extract::multipart::MultipartError) -> Self {
		VermError::ReadBodyFailure { message: e.to_string() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_codes() {
		assert_eq!(VermError::UnsupportedEncoding { encoding: "br".into() }.status_code(), 400);
		assert_eq!(VermError::WrongLocation { location: "/x".into() }.status_code(), 422);
		assert_eq!(VermError::NotFound.status_code(), 404);
		assert_eq!(VermError::MethodNotSupported.status_code(), 405);
		assert_eq!(
			VermError::Filesystem(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
				.status_code(),
			500
		);
	}

	#[test]
	fn test_io_error_classification() {
		let decode: VermError = io::Error::new(io::ErrorKind::InvalidData, "bad gzip").into();
		assert!(matches!(decode, VermError::DecodeFailure { .. }));

		let fs: VermError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
		assert!(matches!(fs, VermError::Filesystem(_)));
	}
}

// vim: ts=4

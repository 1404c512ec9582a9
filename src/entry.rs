//! Search results and helper methods for extracting data from them.
use std::collections::HashMap;

use ldap3::SearchEntry;

/// A directory entry returned by a search.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
	/// Distinguished name of the entry.
	pub dn: String,
	/// Attribute values by attribute description. Values keep the order the
	/// server sent them in.
	pub attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl From<SearchEntry> for Entry {
	fn from(entry: SearchEntry) -> Self {
		let mut attrs: HashMap<String, Vec<Vec<u8>>> = entry
			.attrs
			.into_iter()
			.map(|(name, values)| (name, values.into_iter().map(String::into_bytes).collect()))
			.collect();
		for (name, values) in entry.bin_attrs {
			attrs.entry(name).or_default().extend(values);
		}
		Self { dn: entry.dn, attrs }
	}
}

/// Terminal outcome of a successful search.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchResult {
	/// Entries in arrival order.
	pub entries: Vec<Entry>,
	/// Continuation references returned instead of entries. These are not
	/// followed.
	pub references: Vec<String>,
}

/// Attribute values that do not have the expected syntax.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AttributeError {
	/// The contents of an attribute did not conform to the expected syntax.
	#[error("Malformed value of attribute {0}")]
	Invalid(String),
}

/// An extension trait for search entries that provides convenience methods
/// for extracting data.
pub trait EntryExt {
	/// Get the first value of an attribute. Will return `None` if attribute
	/// value is not valid UTF-8.
	fn attr_first(&self, attr: &str) -> Option<&str>;

	/// Get the first value of an attribute, in binary form
	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]>;

	/// Get the first value of an attribute, interpreted as a boolean.
	fn bool_first(&self, attr: &str) -> Option<Result<bool, AttributeError>> {
		match self.attr_first(attr) {
			Some("TRUE") => Some(Ok(true)),
			Some("FALSE") => Some(Ok(false)),
			Some(_) => Some(Err(AttributeError::Invalid(attr.to_owned()))),
			None => None,
		}
	}
}

impl EntryExt for Entry {
	fn attr_first(&self, attr: &str) -> Option<&str> {
		std::str::from_utf8(self.bin_attr_first(attr)?).ok()
	}

	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]> {
		self.attrs.get(attr)?.first().map(Vec::as_slice)
	}
}

impl EntryExt for SearchEntry {
	fn attr_first(&self, attr: &str) -> Option<&str> {
		let attr = self.attrs.get(attr)?;
		attr.first().map(String::as_str)
	}

	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]> {
		if let Some(attr) = self.attrs.get(attr) {
			return attr.first().map(String::as_bytes);
		}

		if let Some(attr) = self.bin_attrs.get(attr) {
			return attr.first().map(Vec::as_slice);
		}
		None
	}
}

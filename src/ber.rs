//! BER tag-length-value primitives.
//!
//! Only the subset of BER permitted by RFC 4511 section 5.1 is accepted:
//! definite lengths and tag numbers below 31. Reading happens from complete
//! in-memory slices; the framing layer in [`crate::codec`] makes sure a whole
//! message is available before any of it is parsed.

use crate::error::DecodeError;

/// Universal BOOLEAN.
pub(crate) const BOOLEAN: u8 = 0x01;
/// Universal INTEGER.
pub(crate) const INTEGER: u8 = 0x02;
/// Universal OCTET STRING.
pub(crate) const OCTET_STRING: u8 = 0x04;
/// Universal ENUMERATED.
pub(crate) const ENUMERATED: u8 = 0x0A;
/// Universal constructed SEQUENCE.
pub(crate) const SEQUENCE: u8 = 0x30;
/// Universal constructed SET.
pub(crate) const SET: u8 = 0x31;

/// Maximum number of length octets accepted in the long form.
const MAX_LENGTH_OCTETS: usize = 4;

/// The identifier and length octets of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
	/// Identifier octet.
	pub(crate) tag: u8,
	/// Length of the contents.
	pub(crate) len: usize,
	/// Number of octets taken by identifier and length.
	pub(crate) header_len: usize,
}

impl Header {
	/// Total size of the element.
	pub(crate) fn element_len(&self) -> usize {
		self.header_len.saturating_add(self.len)
	}
}

/// Parses the header at the start of `buf`. Returns `Ok(None)` if `buf` ends
/// before the header is complete.
pub(crate) fn parse_header(buf: &[u8]) -> Result<Option<Header>, DecodeError> {
	let Some(&tag) = buf.first() else {
		return Ok(None);
	};
	if tag & 0x1F == 0x1F {
		return Err(DecodeError::HighTagNumber);
	}
	let Some(&first) = buf.get(1) else {
		return Ok(None);
	};
	if first & 0x80 == 0 {
		return Ok(Some(Header { tag, len: usize::from(first), header_len: 2 }));
	}

	let octets = usize::from(first & 0x7F);
	if octets == 0 {
		return Err(DecodeError::IndefiniteLength);
	}
	if octets > MAX_LENGTH_OCTETS {
		return Err(DecodeError::LengthOverflow(octets));
	}
	let Some(bytes) = buf.get(2..2 + octets) else {
		return Ok(None);
	};
	let len = bytes.iter().fold(0_usize, |acc, byte| (acc << 8) | usize::from(*byte));
	Ok(Some(Header { tag, len, header_len: 2 + octets }))
}

/// Decodes the two's complement contents of an INTEGER or ENUMERATED.
fn decode_integer(content: &[u8]) -> Result<i64, DecodeError> {
	let Some(&first) = content.first() else {
		return Err(DecodeError::InvalidInteger);
	};
	if content.len() > 8 {
		return Err(DecodeError::InvalidInteger);
	}
	let init: i64 = if first & 0x80 == 0 { 0 } else { -1 };
	Ok(content.iter().fold(init, |acc, byte| (acc << 8) | i64::from(*byte)))
}

/// Minimal two's complement big-endian encoding of `value`.
fn encode_integer(value: i64) -> Vec<u8> {
	let bytes = value.to_be_bytes();
	let mut start = 0;
	while start < bytes.len() - 1 {
		let next_negative = bytes[start + 1] & 0x80 != 0;
		match bytes[start] {
			0x00 if !next_negative => start += 1,
			0xFF if next_negative => start += 1,
			_ => break,
		}
	}
	bytes[start..].to_vec()
}

/// Sequential reader over the elements of a complete BER buffer.
#[derive(Debug, Clone)]
pub(crate) struct BerReader<'a> {
	/// Bytes not yet consumed.
	data: &'a [u8],
}

impl<'a> BerReader<'a> {
	pub(crate) fn new(data: &'a [u8]) -> Self {
		Self { data }
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// The identifier of the next element, if any.
	pub(crate) fn peek_tag(&self) -> Option<u8> {
		self.data.first().copied()
	}

	/// Reads the next element, returning its tag and contents.
	pub(crate) fn read_element(&mut self) -> Result<(u8, &'a [u8]), DecodeError> {
		let header = parse_header(self.data)?.ok_or(DecodeError::Truncated)?;
		if self.data.len() < header.element_len() {
			return Err(DecodeError::Truncated);
		}
		let (element, rest) = self.data.split_at(header.element_len());
		self.data = rest;
		Ok((header.tag, &element[header.header_len..]))
	}

	/// Reads the next element, which must carry `tag`.
	pub(crate) fn read_tagged(&mut self, tag: u8) -> Result<&'a [u8], DecodeError> {
		match self.peek_tag() {
			Some(found) if found != tag => {
				Err(DecodeError::UnexpectedTag { expected: tag, found })
			}
			_ => self.read_element().map(|(_, content)| content),
		}
	}

	/// Reads the next element if it carries `tag`.
	pub(crate) fn read_optional(&mut self, tag: u8) -> Result<Option<&'a [u8]>, DecodeError> {
		if self.peek_tag() == Some(tag) {
			self.read_tagged(tag).map(Some)
		} else {
			Ok(None)
		}
	}

	/// Reads a nested reader over the contents of the next element.
	pub(crate) fn read_constructed(&mut self, tag: u8) -> Result<BerReader<'a>, DecodeError> {
		self.read_tagged(tag).map(BerReader::new)
	}

	pub(crate) fn read_integer_tagged(&mut self, tag: u8) -> Result<i64, DecodeError> {
		decode_integer(self.read_tagged(tag)?)
	}

	pub(crate) fn read_integer(&mut self) -> Result<i64, DecodeError> {
		self.read_integer_tagged(INTEGER)
	}

	pub(crate) fn read_enumerated(&mut self) -> Result<i64, DecodeError> {
		self.read_integer_tagged(ENUMERATED)
	}

	pub(crate) fn read_bool_tagged(&mut self, tag: u8) -> Result<bool, DecodeError> {
		match self.read_tagged(tag)? {
			[value] => Ok(*value != 0),
			_ => Err(DecodeError::InvalidBoolean),
		}
	}

	pub(crate) fn read_bool(&mut self) -> Result<bool, DecodeError> {
		self.read_bool_tagged(BOOLEAN)
	}

	/// Reads a UTF-8 string carried under `tag`.
	pub(crate) fn read_string_tagged(&mut self, tag: u8) -> Result<String, DecodeError> {
		let bytes = self.read_tagged(tag)?;
		String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
	}

	/// Reads an LDAPString / LDAPDN (OCTET STRING holding UTF-8).
	pub(crate) fn read_string(&mut self) -> Result<String, DecodeError> {
		self.read_string_tagged(OCTET_STRING)
	}

	/// Ensures all input has been consumed.
	pub(crate) fn finish(self) -> Result<(), DecodeError> {
		if self.data.is_empty() {
			Ok(())
		} else {
			Err(DecodeError::TrailingData)
		}
	}
}

/// Builder for BER encoded data.
#[derive(Debug, Default)]
pub(crate) struct BerWriter {
	/// Encoded output.
	buffer: Vec<u8>,
}

impl BerWriter {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn into_bytes(self) -> Vec<u8> {
		self.buffer
	}

	fn write_header(&mut self, tag: u8, len: usize) {
		self.buffer.push(tag);
		if len < 0x80 {
			// Short form
			self.buffer.push(len as u8);
		} else {
			let bytes = len.to_be_bytes();
			let skip = bytes.iter().take_while(|byte| **byte == 0).count();
			let significant = &bytes[skip..];
			self.buffer.push(0x80 | significant.len() as u8);
			self.buffer.extend_from_slice(significant);
		}
	}

	/// Writes a primitive element with the given contents.
	pub(crate) fn write_element(&mut self, tag: u8, content: &[u8]) {
		self.write_header(tag, content.len());
		self.buffer.extend_from_slice(content);
	}

	/// Writes a constructed element whose contents are produced by `build`.
	pub(crate) fn write_constructed(&mut self, tag: u8, build: impl FnOnce(&mut BerWriter)) {
		let mut inner = BerWriter::new();
		build(&mut inner);
		self.write_element(tag, &inner.buffer);
	}

	pub(crate) fn write_integer_tagged(&mut self, tag: u8, value: i64) {
		self.write_element(tag, &encode_integer(value));
	}

	pub(crate) fn write_integer(&mut self, value: i64) {
		self.write_integer_tagged(INTEGER, value);
	}

	pub(crate) fn write_enumerated(&mut self, value: i64) {
		self.write_integer_tagged(ENUMERATED, value);
	}

	pub(crate) fn write_bool_tagged(&mut self, tag: u8, value: bool) {
		self.write_element(tag, &[if value { 0xFF } else { 0x00 }]);
	}

	pub(crate) fn write_bool(&mut self, value: bool) {
		self.write_bool_tagged(BOOLEAN, value);
	}

	pub(crate) fn write_octets(&mut self, value: &[u8]) {
		self.write_element(OCTET_STRING, value);
	}

	pub(crate) fn write_string(&mut self, value: &str) {
		self.write_octets(value.as_bytes());
	}
}

//! Search filters: the RFC 4515 string form found in LDAP URLs and the BER
//! form sent inside a SearchRequest.
use std::{fmt, str::FromStr};

use crate::{
	ber::{BerReader, BerWriter, OCTET_STRING, SEQUENCE},
	error::DecodeError,
};

/// Context tags of the `Filter` CHOICE.
const AND: u8 = 0xA0;
const OR: u8 = 0xA1;
const NOT: u8 = 0xA2;
const EQUALITY: u8 = 0xA3;
const SUBSTRINGS: u8 = 0xA4;
const GREATER_OR_EQUAL: u8 = 0xA5;
const LESS_OR_EQUAL: u8 = 0xA6;
const PRESENT: u8 = 0x87;
const APPROX: u8 = 0xA8;
const EXTENSIBLE: u8 = 0xA9;

/// Tags inside `SubstringFilter` and `MatchingRuleAssertion`.
const SUB_INITIAL: u8 = 0x80;
const SUB_ANY: u8 = 0x81;
const SUB_FINAL: u8 = 0x82;
const MATCHING_RULE: u8 = 0x81;
const MATCH_TYPE: u8 = 0x82;
const MATCH_VALUE: u8 = 0x83;
const DN_ATTRIBUTES: u8 = 0x84;

/// Deepest nesting of `and`, `or` and `not` accepted when parsing a filter,
/// in string or BER form.
pub const MAX_FILTER_DEPTH: usize = 100;

/// A parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
	/// All of the filters match. Empty means "true" (RFC 4526).
	And(Vec<Filter>),
	/// Any of the filters matches. Empty means "false" (RFC 4526).
	Or(Vec<Filter>),
	/// The filter does not match.
	Not(Box<Filter>),
	/// `(attr=value)`
	Equality {
		/// Attribute description.
		attr: String,
		/// Assertion value.
		value: Vec<u8>,
	},
	/// `(attr=ini*any*fin)`
	Substrings {
		/// Attribute description.
		attr: String,
		/// Leading substring.
		initial: Option<Vec<u8>>,
		/// Substrings in between, in order.
		any: Vec<Vec<u8>>,
		/// Trailing substring.
		last: Option<Vec<u8>>,
	},
	/// `(attr>=value)`
	GreaterOrEqual {
		/// Attribute description.
		attr: String,
		/// Assertion value.
		value: Vec<u8>,
	},
	/// `(attr<=value)`
	LessOrEqual {
		/// Attribute description.
		attr: String,
		/// Assertion value.
		value: Vec<u8>,
	},
	/// `(attr=*)`
	Present(String),
	/// `(attr~=value)`
	Approx {
		/// Attribute description.
		attr: String,
		/// Assertion value.
		value: Vec<u8>,
	},
	/// `(attr:dn:rule:=value)`
	Extensible {
		/// Matching rule OID or name.
		rule: Option<String>,
		/// Attribute description.
		attr: Option<String>,
		/// Assertion value.
		value: Vec<u8>,
		/// Whether DN attributes are considered.
		dn_attributes: bool,
	},
}

/// Reasons a string filter fails to parse.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
	/// The filter ended in the middle of an expression.
	#[error("Unexpected end of filter")]
	UnexpectedEnd,
	/// A character not allowed at this position.
	#[error("Unexpected character `{ch}` at offset {pos}")]
	UnexpectedChar {
		/// The offending character.
		ch: char,
		/// Byte offset into the filter.
		pos: usize,
	},
	/// A backslash not followed by two hex digits.
	#[error("Invalid escape sequence at offset {0}")]
	InvalidEscape(usize),
	/// An empty or malformed attribute description.
	#[error("Invalid attribute description `{0}`")]
	InvalidAttribute(String),
	/// An item without `=`.
	#[error("Missing comparison operator in `{0}`")]
	MissingOperator(String),
	/// Input remains after the outermost filter.
	#[error("Trailing input at offset {0}")]
	TrailingInput(usize),
	/// `and`, `or` and `not` are nested deeper than [`MAX_FILTER_DEPTH`].
	#[error("Filter nested deeper than {} levels", MAX_FILTER_DEPTH)]
	TooDeep,
	/// A substring assertion without any substring, such as `(cn=**)`.
	#[error("Empty substring assertion at offset {0}")]
	EmptySubstrings(usize),
}

impl Filter {
	/// Parses a filter in RFC 4515 string form. The surrounding parentheses
	/// may be omitted, as is common in LDAP URLs (`uid=*`).
	pub fn parse(input: &str) -> Result<Self, FilterError> {
		let trimmed = input.trim();
		let wrapped;
		let text = if trimmed.starts_with('(') {
			trimmed
		} else {
			wrapped = format!("({trimmed})");
			&wrapped
		};
		let mut parser = Parser { input: text.as_bytes(), pos: 0, depth: 0 };
		let filter = parser.filter()?;
		if parser.pos != text.len() {
			return Err(FilterError::TrailingInput(parser.pos));
		}
		Ok(filter)
	}

	/// Appends the BER encoding of this filter.
	pub(crate) fn write_ber(&self, writer: &mut BerWriter) {
		match self {
			Filter::And(filters) | Filter::Or(filters) => {
				let tag = if matches!(self, Filter::And(_)) { AND } else { OR };
				writer.write_constructed(tag, |writer| {
					for filter in filters {
						filter.write_ber(writer);
					}
				});
			}
			Filter::Not(filter) => writer.write_constructed(NOT, |writer| filter.write_ber(writer)),
			Filter::Equality { attr, value } => write_assertion(writer, EQUALITY, attr, value),
			Filter::GreaterOrEqual { attr, value } => {
				write_assertion(writer, GREATER_OR_EQUAL, attr, value);
			}
			Filter::LessOrEqual { attr, value } => write_assertion(writer, LESS_OR_EQUAL, attr, value),
			Filter::Approx { attr, value } => write_assertion(writer, APPROX, attr, value),
			Filter::Present(attr) => writer.write_element(PRESENT, attr.as_bytes()),
			Filter::Substrings { attr, initial, any, last } => {
				writer.write_constructed(SUBSTRINGS, |writer| {
					writer.write_string(attr);
					writer.write_constructed(SEQUENCE, |writer| {
						if let Some(initial) = initial {
							writer.write_element(SUB_INITIAL, initial);
						}
						for part in any {
							writer.write_element(SUB_ANY, part);
						}
						if let Some(last) = last {
							writer.write_element(SUB_FINAL, last);
						}
					});
				});
			}
			Filter::Extensible { rule, attr, value, dn_attributes } => {
				writer.write_constructed(EXTENSIBLE, |writer| {
					if let Some(rule) = rule {
						writer.write_element(MATCHING_RULE, rule.as_bytes());
					}
					if let Some(attr) = attr {
						writer.write_element(MATCH_TYPE, attr.as_bytes());
					}
					writer.write_element(MATCH_VALUE, value);
					if *dn_attributes {
						writer.write_bool_tagged(DN_ATTRIBUTES, true);
					}
				});
			}
		}
	}

	/// Reads a BER encoded filter.
	pub(crate) fn read_ber(reader: &mut BerReader<'_>) -> Result<Self, DecodeError> {
		Filter::read_ber_nested(reader, 0)
	}

	fn read_ber_nested(reader: &mut BerReader<'_>, depth: usize) -> Result<Self, DecodeError> {
		let (tag, content) = reader.read_element()?;
		if tag == PRESENT {
			return Ok(Filter::Present(utf8(content)?));
		}

		let mut inner = BerReader::new(content);
		let filter = match tag {
			AND | OR => {
				let depth = nested(depth)?;
				let mut filters = Vec::new();
				while !inner.is_empty() {
					filters.push(Filter::read_ber_nested(&mut inner, depth)?);
				}
				if tag == AND {
					Filter::And(filters)
				} else {
					Filter::Or(filters)
				}
			}
			NOT => Filter::Not(Box::new(Filter::read_ber_nested(&mut inner, nested(depth)?)?)),
			EQUALITY | GREATER_OR_EQUAL | LESS_OR_EQUAL | APPROX => {
				let attr = inner.read_string()?;
				let value = inner.read_tagged(OCTET_STRING)?.to_vec();
				match tag {
					EQUALITY => Filter::Equality { attr, value },
					GREATER_OR_EQUAL => Filter::GreaterOrEqual { attr, value },
					LESS_OR_EQUAL => Filter::LessOrEqual { attr, value },
					_ => Filter::Approx { attr, value },
				}
			}
			SUBSTRINGS => {
				let attr = inner.read_string()?;
				let mut parts = inner.read_constructed(SEQUENCE)?;
				let (mut initial, mut any, mut last) = (None, Vec::new(), None);
				while !parts.is_empty() {
					match parts.read_element()? {
						(SUB_INITIAL, value) => initial = Some(value.to_vec()),
						(SUB_ANY, value) => any.push(value.to_vec()),
						(SUB_FINAL, value) => last = Some(value.to_vec()),
						(found, _) => {
							return Err(DecodeError::UnexpectedTag { expected: SUB_ANY, found })
						}
					}
				}
				if initial.is_none() && any.is_empty() && last.is_none() {
					return Err(DecodeError::EmptySubstrings);
				}
				Filter::Substrings { attr, initial, any, last }
			}
			EXTENSIBLE => {
				let rule = inner.read_optional(MATCHING_RULE)?.map(utf8).transpose()?;
				let attr = inner.read_optional(MATCH_TYPE)?.map(utf8).transpose()?;
				let value = inner.read_tagged(MATCH_VALUE)?.to_vec();
				let dn_attributes = if inner.peek_tag() == Some(DN_ATTRIBUTES) {
					inner.read_bool_tagged(DN_ATTRIBUTES)?
				} else {
					false
				};
				Filter::Extensible { rule, attr, value, dn_attributes }
			}
			other => return Err(DecodeError::UnknownFilter(other)),
		};
		inner.finish()?;
		Ok(filter)
	}
}

impl FromStr for Filter {
	type Err = FilterError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Filter::parse(s)
	}
}

/// Writes an `AttributeValueAssertion` under `tag`.
fn write_assertion(writer: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
	writer.write_constructed(tag, |writer| {
		writer.write_string(attr);
		writer.write_octets(value);
	});
}

/// Depth of the children of a filter at `depth`.
fn nested(depth: usize) -> Result<usize, DecodeError> {
	if depth >= MAX_FILTER_DEPTH {
		return Err(DecodeError::FilterTooDeep);
	}
	Ok(depth + 1)
}

fn utf8(bytes: &[u8]) -> Result<String, DecodeError> {
	String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

/// Recursive descent parser over the bytes of a parenthesized filter.
struct Parser<'a> {
	/// Filter text.
	input: &'a [u8],
	/// Current offset.
	pos: usize,
	/// Number of enclosing `and`, `or` and `not` filters.
	depth: usize,
}

impl Parser<'_> {
	fn peek(&self) -> Option<u8> {
		self.input.get(self.pos).copied()
	}

	fn expect(&mut self, expected: u8) -> Result<(), FilterError> {
		match self.peek() {
			Some(byte) if byte == expected => {
				self.pos += 1;
				Ok(())
			}
			Some(byte) => Err(FilterError::UnexpectedChar { ch: char::from(byte), pos: self.pos }),
			None => Err(FilterError::UnexpectedEnd),
		}
	}

	fn filter(&mut self) -> Result<Filter, FilterError> {
		self.expect(b'(')?;
		let filter = match self.peek() {
			Some(b'&') => {
				self.pos += 1;
				Filter::And(self.nested(Parser::filter_list)?)
			}
			Some(b'|') => {
				self.pos += 1;
				Filter::Or(self.nested(Parser::filter_list)?)
			}
			Some(b'!') => {
				self.pos += 1;
				Filter::Not(Box::new(self.nested(Parser::filter)?))
			}
			Some(_) => self.item()?,
			None => return Err(FilterError::UnexpectedEnd),
		};
		self.expect(b')')?;
		Ok(filter)
	}

	/// Runs `parse` one nesting level deeper.
	fn nested<T>(
		&mut self,
		parse: impl FnOnce(&mut Self) -> Result<T, FilterError>,
	) -> Result<T, FilterError> {
		if self.depth >= MAX_FILTER_DEPTH {
			return Err(FilterError::TooDeep);
		}
		self.depth += 1;
		let parsed = parse(&mut *self);
		self.depth -= 1;
		parsed
	}

	fn filter_list(&mut self) -> Result<Vec<Filter>, FilterError> {
		let mut filters = Vec::new();
		while self.peek() == Some(b'(') {
			filters.push(self.filter()?);
		}
		Ok(filters)
	}

	/// Parses a simple, substring, present or extensible item. Values cannot
	/// contain an unescaped `)`, so the item extends to the next one.
	fn item(&mut self) -> Result<Filter, FilterError> {
		let start = self.pos;
		let len = self.input[start..]
			.iter()
			.position(|byte| *byte == b')')
			.ok_or(FilterError::UnexpectedEnd)?;
		self.pos = start + len;
		let text = &self.input[start..self.pos];

		let eq = text.iter().position(|byte| *byte == b'=').ok_or_else(|| {
			FilterError::MissingOperator(String::from_utf8_lossy(text).into_owned())
		})?;
		let (lhs, raw_value) = (&text[..eq], &text[eq + 1..]);
		let value_pos = start + eq + 1;

		match lhs.last() {
			Some(b'~') => Ok(Filter::Approx {
				attr: attribute(&lhs[..lhs.len() - 1])?,
				value: unescape(raw_value, value_pos, false)?,
			}),
			Some(b'>') => Ok(Filter::GreaterOrEqual {
				attr: attribute(&lhs[..lhs.len() - 1])?,
				value: unescape(raw_value, value_pos, false)?,
			}),
			Some(b'<') => Ok(Filter::LessOrEqual {
				attr: attribute(&lhs[..lhs.len() - 1])?,
				value: unescape(raw_value, value_pos, false)?,
			}),
			Some(b':') => extensible(&lhs[..lhs.len() - 1], unescape(raw_value, value_pos, false)?),
			_ => {
				let attr = attribute(lhs)?;
				if raw_value == b"*" {
					return Ok(Filter::Present(attr));
				}
				if !raw_value.contains(&b'*') {
					return Ok(Filter::Equality { attr, value: unescape(raw_value, value_pos, false)? });
				}

				let mut offset = value_pos;
				let mut parts = Vec::new();
				for part in raw_value.split(|byte| *byte == b'*') {
					parts.push(unescape(part, offset, true)?);
					offset += part.len() + 1;
				}
				let last = parts.pop().filter(|part| !part.is_empty());
				let mut parts = parts.into_iter();
				let initial = parts.next().filter(|part| !part.is_empty());
				let any: Vec<_> = parts.filter(|part| !part.is_empty()).collect();
				if initial.is_none() && any.is_empty() && last.is_none() {
					return Err(FilterError::EmptySubstrings(value_pos));
				}
				Ok(Filter::Substrings { attr, initial, any, last })
			}
		}
	}
}

/// Validates an attribute description (`descr` or numeric OID with options).
fn attribute(bytes: &[u8]) -> Result<String, FilterError> {
	let valid = !bytes.is_empty()
		&& bytes.iter().all(|byte| byte.is_ascii_alphanumeric() || b"-;.".contains(byte));
	let attr = String::from_utf8_lossy(bytes).into_owned();
	if valid {
		Ok(attr)
	} else {
		Err(FilterError::InvalidAttribute(attr))
	}
}

/// Parses the left hand side of an extensible match, `attr:dn:rule` with the
/// trailing `:` of `:=` already removed.
fn extensible(lhs: &[u8], value: Vec<u8>) -> Result<Filter, FilterError> {
	let mut segments = lhs.split(|byte| *byte == b':');
	let attr = match segments.next() {
		Some([]) | None => None,
		Some(attr) => Some(attribute(attr)?),
	};
	let mut dn_attributes = false;
	let mut rule = None;
	for segment in segments {
		if segment.eq_ignore_ascii_case(b"dn") && !dn_attributes && rule.is_none() {
			dn_attributes = true;
		} else if rule.is_none() {
			rule = Some(attribute(segment)?);
		} else {
			return Err(FilterError::InvalidAttribute(String::from_utf8_lossy(lhs).into_owned()));
		}
	}
	if attr.is_none() && rule.is_none() {
		return Err(FilterError::InvalidAttribute(String::from_utf8_lossy(lhs).into_owned()));
	}
	Ok(Filter::Extensible { rule, attr, value, dn_attributes })
}

/// Resolves `\XX` escapes of an assertion value. `pos` is the offset of
/// `raw` in the filter, used for error reporting.
fn unescape(raw: &[u8], pos: usize, in_substring: bool) -> Result<Vec<u8>, FilterError> {
	let mut value = Vec::with_capacity(raw.len());
	let mut index = 0;
	while let Some(&byte) = raw.get(index) {
		match byte {
			b'\\' => {
				let decoded = raw
					.get(index + 1..index + 3)
					.and_then(|hex| std::str::from_utf8(hex).ok())
					.and_then(|hex| u8::from_str_radix(hex, 16).ok())
					.ok_or(FilterError::InvalidEscape(pos + index))?;
				value.push(decoded);
				index += 3;
			}
			b'(' => return Err(FilterError::UnexpectedChar { ch: '(', pos: pos + index }),
			b'*' if !in_substring => {
				return Err(FilterError::UnexpectedChar { ch: '*', pos: pos + index })
			}
			_ => {
				value.push(byte);
				index += 1;
			}
		}
	}
	Ok(value)
}

/// Writes an assertion value with the characters RFC 4515 requires escaped.
fn write_value(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
	if let Ok(text) = std::str::from_utf8(value) {
		for ch in text.chars() {
			match ch {
				'*' | '(' | ')' | '\\' | '\0' => write!(f, "\\{:02x}", u32::from(ch))?,
				_ => fmt::Write::write_char(f, ch)?,
			}
		}
		return Ok(());
	}
	for &byte in value {
		match byte {
			b'*' | b'(' | b')' | b'\\' | 0 | 0x80..=0xFF => write!(f, "\\{byte:02x}")?,
			_ => fmt::Write::write_char(f, char::from(byte))?,
		}
	}
	Ok(())
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Filter::And(filters) | Filter::Or(filters) => {
				f.write_str(if matches!(self, Filter::And(_)) { "(&" } else { "(|" })?;
				for filter in filters {
					write!(f, "{filter}")?;
				}
				f.write_str(")")
			}
			Filter::Not(filter) => write!(f, "(!{filter})"),
			Filter::Equality { attr, value } => {
				write!(f, "({attr}=")?;
				write_value(f, value)?;
				f.write_str(")")
			}
			Filter::GreaterOrEqual { attr, value } => {
				write!(f, "({attr}>=")?;
				write_value(f, value)?;
				f.write_str(")")
			}
			Filter::LessOrEqual { attr, value } => {
				write!(f, "({attr}<=")?;
				write_value(f, value)?;
				f.write_str(")")
			}
			Filter::Approx { attr, value } => {
				write!(f, "({attr}~=")?;
				write_value(f, value)?;
				f.write_str(")")
			}
			Filter::Present(attr) => write!(f, "({attr}=*)"),
			Filter::Substrings { attr, initial, any, last } => {
				write!(f, "({attr}=")?;
				if let Some(initial) = initial {
					write_value(f, initial)?;
				}
				f.write_str("*")?;
				for part in any {
					write_value(f, part)?;
					f.write_str("*")?;
				}
				if let Some(last) = last {
					write_value(f, last)?;
				}
				f.write_str(")")
			}
			Filter::Extensible { rule, attr, value, dn_attributes } => {
				f.write_str("(")?;
				if let Some(attr) = attr {
					f.write_str(attr)?;
				}
				if *dn_attributes {
					f.write_str(":dn")?;
				}
				if let Some(rule) = rule {
					write!(f, ":{rule}")?;
				}
				f.write_str(":=")?;
				write_value(f, value)?;
				f.write_str(")")
			}
		}
	}
}

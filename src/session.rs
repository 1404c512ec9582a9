//! The search state machine.
//!
//! A [`SearchSession`] drives a single search over a [`Connection`]:
//!
//! ```text
//! Idle --send--> Sent --entry--> Streaming --done(success)--> Done
//!   \              \                 \
//!    `--------------`-----------------`--failure--> Errored
//! ```
//!
//! `Done` and `Errored` are absorbing, so a search resolves exactly once.
use tracing::{debug, warn};

use crate::{
	codec::{ProtocolOp, SearchParameters},
	config::SearchConfig,
	descriptor::QueryDescriptor,
	entry::{Entry, SearchResult},
	error::{Error, ResultCode},
	transport::Connection,
};

/// States of a [`SearchSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
	/// The request has not been sent yet.
	Idle,
	/// The request is sent, nothing has been received.
	Sent,
	/// At least one entry has been received.
	Streaming,
	/// The server finished the search successfully.
	Done,
	/// The search failed.
	Errored,
}

impl SearchState {
	/// Whether the search has resolved.
	#[must_use]
	pub fn is_terminal(self) -> bool {
		matches!(self, SearchState::Done | SearchState::Errored)
	}
}

/// One outstanding search on a connection.
#[derive(Debug)]
pub struct SearchSession<'a> {
	connection: &'a mut Connection,
	descriptor: &'a QueryDescriptor,
	options: &'a SearchConfig,
	state: SearchState,
	/// ID the request was sent with, valid from `Sent` on.
	message_id: i32,
	/// Continuation references received so far.
	references: Vec<String>,
}

impl<'a> SearchSession<'a> {
	/// Prepares a search. Nothing is sent before the first call to
	/// [`SearchSession::next`].
	pub fn new(
		connection: &'a mut Connection,
		descriptor: &'a QueryDescriptor,
		options: &'a SearchConfig,
	) -> Self {
		Self {
			connection,
			descriptor,
			options,
			state: SearchState::Idle,
			message_id: 0,
			references: Vec::new(),
		}
	}

	/// Current state.
	#[must_use]
	pub fn state(&self) -> SearchState {
		self.state
	}

	/// Continuation references received so far.
	#[must_use]
	pub fn references(&self) -> &[String] {
		&self.references
	}

	fn advance(&mut self, next: SearchState) {
		if self.state.is_terminal() || self.state == next {
			return;
		}
		debug!("Search {}: {:?} -> {next:?}", self.message_id, self.state);
		self.state = next;
	}

	fn fail(&mut self, err: Error) -> Error {
		warn!("Search {} failed: {err}", self.message_id);
		self.advance(SearchState::Errored);
		err
	}

	/// Returns the next entry, in the order the server sent them. `None` once
	/// the search is over. An error is returned once, after which the search
	/// is over as well.
	pub async fn next(&mut self) -> Result<Option<Entry>, Error> {
		match self.state {
			SearchState::Done | SearchState::Errored => return Ok(None),
			SearchState::Idle => {
				let request = SearchParameters::new(self.descriptor, self.options);
				match self.connection.send(ProtocolOp::SearchRequest(request)).await {
					Ok(message_id) => {
						self.message_id = message_id;
						debug!("Sent search for {}", self.descriptor);
						self.advance(SearchState::Sent);
					}
					Err(err) => return Err(self.fail(err)),
				}
			}
			SearchState::Sent | SearchState::Streaming => {}
		}

		loop {
			let operation = match self.connection.read_response(self.message_id).await {
				Ok(operation) => operation,
				Err(err) => return Err(self.fail(err)),
			};
			match operation {
				ProtocolOp::SearchResultEntry(entry) => {
					self.advance(SearchState::Streaming);
					return Ok(Some(entry));
				}
				ProtocolOp::SearchResultReference(urls) => {
					debug!("Search {} continues at {urls:?}", self.message_id);
					self.references.extend(urls);
				}
				ProtocolOp::SearchResultDone(result) => {
					if let Err(err) = result.success() {
						return Err(self.fail(err));
					}
					self.advance(SearchState::Done);
					return Ok(None);
				}
				_ => {
					return Err(self.fail(Error::protocol(
						ResultCode::ProtocolError,
						"Unexpected response to search",
					)))
				}
			}
		}
	}
}

/// Runs a search over `connection`. `on_entry` is called for every entry in
/// arrival order, then `on_complete` is called exactly once with either all
/// entries or the error which ended the search. Entries already passed to
/// `on_entry` stay delivered when the search fails later.
pub async fn search<E, C>(
	connection: &mut Connection,
	descriptor: &QueryDescriptor,
	options: &SearchConfig,
	mut on_entry: E,
	on_complete: C,
) where
	E: FnMut(&Entry) + Send,
	C: FnOnce(Result<SearchResult, Error>) + Send,
{
	let mut session = SearchSession::new(connection, descriptor, options);
	let mut entries = Vec::new();
	let outcome = loop {
		match session.next().await {
			Ok(Some(entry)) => {
				on_entry(&entry);
				entries.push(entry);
			}
			Ok(None) => {
				debug!("Search finished with {} entries", entries.len());
				break Ok(SearchResult { entries, references: session.references });
			}
			Err(err) => break Err(err),
		}
	};
	on_complete(outcome);
}

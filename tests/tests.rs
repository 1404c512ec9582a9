#![allow(
	clippy::dbg_macro,
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::print_stderr,
	clippy::print_stdout,
	clippy::unwrap_used
)]
use std::{error::Error as StdError, time::Duration};

use ldap_search::{
	codec::{
		BindRequest, ExtendedResponse, LdapResult, ProtocolOp, NOTICE_OF_DISCONNECTION_OID,
		START_TLS_OID,
	},
	config::BindConfig,
	connect,
	error::ConnectionError,
	search, search_url, ConnectionState, Directory, Entry, EntryExt, Error, ErrorKind,
	Ldap3Directory, NativeDirectory, QueryDescriptor, ResultCode, SearchResult,
};
use serial_test::serial;

mod common;

use common::{
	answer_search, done, entry, init_tracing, ldap_add_organizational_unit, ldap_add_user,
	ldap_connect, ldap_delete_organizational_unit, ldap_delete_user, serve, serve_self_signed_tls,
	test_config,
};

/// Everything a search delivered to its callbacks.
struct Outcome {
	entries: Vec<Entry>,
	result: Result<SearchResult, Error>,
}

async fn run_search_url<D: Directory + Sync>(directory: &D, url: &str) -> Outcome {
	let mut entries = Vec::new();
	let mut completions = Vec::new();
	search_url(directory, url, |entry| entries.push(entry.clone()), |result| completions.push(result))
		.await;
	assert_eq!(completions.len(), 1, "on_complete must be called exactly once");
	Outcome { entries, result: completions.pop().unwrap() }
}

fn url(port: u16, rest: &str) -> String {
	format!("ldap://127.0.0.1:{port}/{rest}")
}

#[tokio::test]
async fn empty_search_succeeds_without_entries() -> Result<(), Box<dyn StdError>> {
	init_tracing();
	let (port, server) = serve(|peer| answer_search(peer, vec![done(ResultCode::Success)], 64)).await;

	let directory = NativeDirectory::new(test_config());
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld?cn?one?(uid=*)")).await;

	assert!(outcome.entries.is_empty());
	assert_eq!(outcome.result?, SearchResult::default());

	let received = server.await?;
	let ProtocolOp::SearchRequest(request) = &received[0].operation else {
		panic!("search request expected, got {:?}", received[0]);
	};
	assert_eq!(request.base_dn, "dc=example,dc=tld");
	assert_eq!(request.attributes, vec!["cn".to_owned()]);
	assert_eq!(request.filter.to_string(), "(uid=*)");
	assert_eq!(received.last().map(|message| &message.operation), Some(&ProtocolOp::UnbindRequest));
	Ok(())
}

#[tokio::test]
async fn entries_arrive_in_order_from_a_byte_by_byte_stream() -> Result<(), Box<dyn StdError>> {
	let replies = vec![
		entry("uid=alice,dc=example,dc=tld", &[("cn", &["Alice"]), ("mail", &["alice@example.tld"])]),
		ProtocolOp::SearchResultReference(vec!["ldap://b.example.tld/dc=example,dc=tld".to_owned()]),
		entry("uid=bob,dc=example,dc=tld", &[("cn", &["Bob"])]),
		entry("uid=carol,dc=example,dc=tld", &[("cn", &["Carol"])]),
		done(ResultCode::Success),
	];
	let (port, server) = serve(|peer| answer_search(peer, replies, 1)).await;

	let directory = NativeDirectory::new(test_config());
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld?cn,mail")).await;

	let dns: Vec<&str> = outcome.entries.iter().map(|entry| entry.dn.as_str()).collect();
	assert_eq!(
		dns,
		["uid=alice,dc=example,dc=tld", "uid=bob,dc=example,dc=tld", "uid=carol,dc=example,dc=tld"]
	);
	assert_eq!(outcome.entries[0].attr_first("mail"), Some("alice@example.tld"));

	let result = outcome.result?;
	assert_eq!(result.entries, outcome.entries);
	assert_eq!(result.references, vec!["ldap://b.example.tld/dc=example,dc=tld".to_owned()]);
	server.await?;
	Ok(())
}

#[tokio::test]
async fn failing_result_codes_have_distinct_kinds() -> Result<(), Box<dyn StdError>> {
	let directory = NativeDirectory::new(test_config());
	let mut kinds = Vec::new();
	for code in [ResultCode::SizeLimitExceeded, ResultCode::Referral, ResultCode::OperationsError] {
		let mut result = LdapResult::new(code);
		if code == ResultCode::Referral {
			result.referrals.push("ldap://b.example.tld/dc=example,dc=tld".to_owned());
		}
		let replies =
			vec![entry("uid=alice,dc=example,dc=tld", &[]), ProtocolOp::SearchResultDone(result)];
		let (port, server) = serve(|peer| answer_search(peer, replies, 16)).await;

		let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld")).await;
		// Already delivered entries are not taken back
		assert_eq!(outcome.entries.len(), 1);
		let err = outcome.result.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Protocol(code));
		if let Error::Protocol { referrals, .. } = &err {
			assert_eq!(referrals.len(), usize::from(code == ResultCode::Referral));
		}
		kinds.push(err.kind());
		server.await?;
	}
	kinds.dedup();
	assert_eq!(kinds.len(), 3);
	Ok(())
}

#[tokio::test]
async fn closing_the_connection_cancels_a_streaming_search() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|mut peer| async move {
		if let Some(request) = peer.recv().await {
			peer.reply(request.message_id, entry("uid=alice,dc=example,dc=tld", &[])).await;
			peer.reply(request.message_id, entry("uid=bob,dc=example,dc=tld", &[])).await;
		}
		peer.drain().await;
		peer
	})
	.await;

	let config = test_config();
	let descriptor = QueryDescriptor::parse(&url(port, "dc=example,dc=tld"))?;
	let mut connection = connect("127.0.0.1", port, false, &config.connection).await?;
	let handle = connection.close_handle();

	let mut entries = Vec::new();
	let mut completion = None;
	search(
		&mut connection,
		&descriptor,
		&config.search,
		|entry| {
			entries.push(entry.dn.clone());
			handle.close();
		},
		|result| completion = Some(result),
	)
	.await;

	assert_eq!(entries, ["uid=alice,dc=example,dc=tld"]);
	assert_eq!(completion.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);
	assert_eq!(connection.state(), ConnectionState::Closed);
	assert!(handle.is_closed());

	// The socket is released, so the server sees the client leave
	let received = server.await?;
	assert_eq!(received.len(), 1);
	Ok(())
}

#[tokio::test]
async fn closing_from_another_task_cancels_a_pending_search() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|mut peer| async move {
		peer.drain().await;
		peer
	})
	.await;

	let config = test_config();
	let descriptor = QueryDescriptor::parse(&url(port, "dc=example,dc=tld"))?;
	let mut connection = connect("127.0.0.1", port, false, &config.connection).await?;
	let handle = connection.close_handle();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(50)).await;
		handle.close();
	});

	let mut completion = None;
	search(&mut connection, &descriptor, &config.search, |_| {}, |result| completion = Some(result))
		.await;

	assert!(matches!(completion, Some(Err(Error::Cancelled))));
	assert_eq!(connection.state(), ConnectionState::Closed);
	server.await?;
	Ok(())
}

#[tokio::test]
async fn ldaps_against_a_plain_server_fails_without_fallback() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|mut peer| async move {
		// Whatever the client sends, answer in plaintext LDAP
		let mut bytes = Vec::new();
		for operation in [entry("uid=alice,dc=example,dc=tld", &[]), done(ResultCode::Success)] {
			bytes.extend(ldap_search::codec::ProtocolMessage { message_id: 1, operation }.encode());
		}
		peer.write_chunked(&bytes, bytes.len()).await;
		peer
	})
	.await;

	let directory = NativeDirectory::new(test_config());
	let outcome =
		run_search_url(&directory, &format!("ldaps://127.0.0.1:{port}/dc=example,dc=tld")).await;

	assert!(outcome.entries.is_empty());
	let err = outcome.result.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Connection, "{err}");
	server.await?;
	Ok(())
}

#[tokio::test]
async fn untrusted_certificate_fails_the_handshake() -> Result<(), Box<dyn StdError>> {
	init_tracing();
	let (port, server) = serve_self_signed_tls().await;

	let directory = NativeDirectory::new(test_config());
	let outcome =
		run_search_url(&directory, &format!("ldaps://localhost:{port}/dc=example,dc=tld")).await;

	assert!(outcome.entries.is_empty());
	let err = outcome.result.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Connection, "{err}");
	assert!(matches!(err, Error::Connection(ConnectionError::Tls(_))), "{err}");

	let log = server.await?;
	assert_eq!(log.first_byte, Some(0x16), "the client must start with a TLS handshake");
	assert!(log.plaintext.is_none(), "no LDAP bytes may reach the server");
	Ok(())
}

#[tokio::test]
async fn stalled_starttls_handshake_times_out() -> Result<(), Box<dyn StdError>> {
	init_tracing();
	let (port, server) = serve(|mut peer| async move {
		if let Some(request) = peer.recv().await {
			peer.reply(
				request.message_id,
				ProtocolOp::ExtendedResponse(ExtendedResponse {
					result: LdapResult::new(ResultCode::Success),
					name: Some(START_TLS_OID.to_owned()),
					value: None,
				}),
			)
			.await;
		}
		// Never answer the ClientHello
		tokio::time::sleep(Duration::from_secs(30)).await;
		peer
	})
	.await;

	let mut config = test_config();
	config.connection.timeout = 1;
	config.connection.tls.starttls = true;
	let connecting = connect("127.0.0.1", port, false, &config.connection);
	let result = tokio::time::timeout(Duration::from_secs(10), connecting).await?;

	let Err(Error::Connection(ConnectionError::Timeout(timeout))) = &result else {
		panic!("expected a timeout, got {result:?}");
	};
	assert_eq!(*timeout, Duration::from_secs(1));
	server.abort();
	Ok(())
}

#[tokio::test]
async fn close_finishes_when_the_server_stops_reading() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|peer| async move {
		tokio::time::sleep(Duration::from_secs(30)).await;
		peer
	})
	.await;

	let mut config = test_config();
	config.connection.operation_timeout = Duration::from_secs(1);
	let mut connection = connect("127.0.0.1", port, false, &config.connection).await?;
	tokio::time::timeout(Duration::from_secs(5), connection.close()).await?;
	assert_eq!(connection.state(), ConnectionState::Closed);
	server.abort();
	Ok(())
}

#[tokio::test]
async fn refused_connection_is_a_connection_error() -> Result<(), Box<dyn StdError>> {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
	let port = listener.local_addr()?.port();
	drop(listener);

	let directory = NativeDirectory::new(test_config());
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld")).await;
	assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Connection);
	Ok(())
}

#[tokio::test]
async fn malformed_ber_aborts_the_search() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|mut peer| async move {
		if peer.recv().await.is_some() {
			// Indefinite length form
			peer.write_chunked(&[0x30, 0x80, 0x02, 0x01, 0x01, 0x65, 0x80, 0x00, 0x00], 9).await;
		}
		peer.drain().await;
		peer
	})
	.await;

	let directory = NativeDirectory::new(test_config());
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld")).await;
	assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Decode);
	server.await?;
	Ok(())
}

/// BER element with definite length.
fn ber(tag: u8, content: &[u8]) -> Vec<u8> {
	let mut element = vec![tag];
	let len = content.len();
	if len < 0x80 {
		element.push(len as u8);
	} else {
		let octets: Vec<u8> =
			len.to_be_bytes().into_iter().skip_while(|octet| *octet == 0).collect();
		element.push(0x80 | octets.len() as u8);
		element.extend(octets);
	}
	element.extend_from_slice(content);
	element
}

#[tokio::test]
async fn server_sent_request_with_nested_filter_is_a_decode_error() -> Result<(), Box<dyn StdError>> {
	let mut filter = ber(0x87, b"a");
	for _ in 0..5_000 {
		filter = ber(0xA2, &filter);
	}
	let mut body = ber(0x04, b"");
	body.extend_from_slice(&[0x0A, 0x01, 0x00, 0x0A, 0x01, 0x00, 0x02, 0x01, 0x00]);
	body.extend_from_slice(&[0x02, 0x01, 0x00, 0x01, 0x01, 0x00]);
	body.extend(filter);
	body.extend(ber(0x30, &[]));
	let mut message = vec![0x02, 0x01, 0x01];
	message.extend(ber(0x63, &body));
	let message = ber(0x30, &message);

	let (port, server) = serve(|mut peer| async move {
		if peer.recv().await.is_some() {
			peer.write_chunked(&message, 4096).await;
		}
		peer.drain().await;
		peer
	})
	.await;

	let directory = NativeDirectory::new(test_config());
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld")).await;
	assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Decode);
	server.await?;
	Ok(())
}

#[tokio::test]
async fn malformed_urls_fail_before_connecting() {
	let directory = NativeDirectory::new(test_config());
	for url in [
		"http://127.0.0.1/dc=example,dc=tld",
		"ldap:///dc=example,dc=tld",
		"ldap://127.0.0.1/dc=example,dc=tld??everything",
		"ldap://127.0.0.1/dc=example,dc=tld???(cn=",
		"not a url",
	] {
		let outcome = run_search_url(&directory, url).await;
		assert!(outcome.entries.is_empty());
		assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Parse, "{url}");
	}
}

#[tokio::test]
async fn binds_before_searching() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|mut peer| async move {
		if let Some(bind) = peer.recv().await {
			peer.reply(bind.message_id, ProtocolOp::BindResponse(LdapResult::new(ResultCode::Success)))
				.await;
		}
		answer_search(peer, vec![entry("uid=alice,dc=example,dc=tld", &[]), done(ResultCode::Success)], 5)
			.await
	})
	.await;

	let mut config = test_config();
	config.bind = Some(BindConfig { dn: "cn=admin,dc=example,dc=tld".to_owned(), password: "secret".to_owned() });
	let directory = NativeDirectory::new(config);
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld")).await;
	assert_eq!(outcome.result?.entries.len(), 1);

	let received = server.await?;
	assert_eq!(
		received[0].operation,
		ProtocolOp::BindRequest(BindRequest {
			version: 3,
			name: "cn=admin,dc=example,dc=tld".to_owned(),
			password: "secret".to_owned(),
		})
	);
	assert!(matches!(received[1].operation, ProtocolOp::SearchRequest(_)));
	assert_eq!(received[2].operation, ProtocolOp::UnbindRequest);
	let ids: Vec<i32> = received.iter().map(|message| message.message_id).collect();
	assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "message IDs must increase: {ids:?}");
	Ok(())
}

#[tokio::test]
async fn failed_bind_ends_with_its_result_code() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|mut peer| async move {
		if let Some(bind) = peer.recv().await {
			let mut result = LdapResult::new(ResultCode::InvalidCredentials);
			result.message = "wrong password".to_owned();
			peer.reply(bind.message_id, ProtocolOp::BindResponse(result)).await;
		}
		peer.drain().await;
		peer
	})
	.await;

	let mut config = test_config();
	config.bind = Some(BindConfig { dn: "cn=admin,dc=example,dc=tld".to_owned(), password: "nope".to_owned() });
	let directory = NativeDirectory::new(config);
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld")).await;

	let Err(Error::Protocol { code, message, .. }) = outcome.result else {
		panic!("bind failure expected");
	};
	assert_eq!(code, ResultCode::InvalidCredentials);
	assert_eq!(message, "wrong password");

	let received = server.await?;
	assert!(received.iter().all(|message| !matches!(message.operation, ProtocolOp::SearchRequest(_))));
	Ok(())
}

#[tokio::test]
async fn refused_starttls_never_continues_in_plaintext() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|mut peer| async move {
		if let Some(request) = peer.recv().await {
			peer.reply(
				request.message_id,
				ProtocolOp::ExtendedResponse(ExtendedResponse {
					result: LdapResult::new(ResultCode::UnavailableCriticalExtension),
					name: None,
					value: None,
				}),
			)
			.await;
		}
		peer.drain().await;
		peer
	})
	.await;

	let mut config = test_config();
	config.connection.tls.starttls = true;
	let directory = NativeDirectory::new(config);
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld")).await;

	assert!(matches!(
		outcome.result,
		Err(Error::Connection(ConnectionError::StartTlsRefused(
			ResultCode::UnavailableCriticalExtension
		)))
	));
	let received = server.await?;
	assert_eq!(received.len(), 1);
	let ProtocolOp::ExtendedRequest(request) = &received[0].operation else {
		panic!("StartTLS request expected");
	};
	assert_eq!(request.name, START_TLS_OID);
	Ok(())
}

#[tokio::test]
async fn notice_of_disconnection_ends_the_search() -> Result<(), Box<dyn StdError>> {
	let (port, server) = serve(|mut peer| async move {
		if peer.recv().await.is_some() {
			let mut result = LdapResult::new(ResultCode::Unavailable);
			result.message = "shutting down".to_owned();
			peer.reply(
				0,
				ProtocolOp::ExtendedResponse(ExtendedResponse {
					result,
					name: Some(NOTICE_OF_DISCONNECTION_OID.to_owned()),
					value: None,
				}),
			)
			.await;
		}
		peer.drain().await;
		peer
	})
	.await;

	let directory = NativeDirectory::new(test_config());
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld")).await;
	assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Protocol(ResultCode::Unavailable));
	server.await?;
	Ok(())
}

#[tokio::test]
async fn ldap3_directory_streams_entries() -> Result<(), Box<dyn StdError>> {
	let replies = vec![
		entry("uid=alice,dc=example,dc=tld", &[("cn", &["Alice"])]),
		entry("uid=bob,dc=example,dc=tld", &[("cn", &["Bob"])]),
		done(ResultCode::Success),
	];
	let (port, server) = serve(|peer| answer_search(peer, replies, 3)).await;

	let directory = Ldap3Directory::new(test_config());
	let outcome = run_search_url(&directory, &url(port, "dc=example,dc=tld?cn?sub?uid=*")).await;

	let names: Vec<Option<&str>> = outcome.entries.iter().map(|entry| entry.attr_first("cn")).collect();
	assert_eq!(names, [Some("Alice"), Some("Bob")]);
	assert_eq!(outcome.result?.entries.len(), 2);
	server.await?;
	Ok(())
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn ldap_search_test() -> Result<(), Box<dyn StdError>> {
	init_tracing();

	let mut ldap = ldap_connect().await?;
	let _ = ldap_delete_organizational_unit(&mut ldap, "users").await;

	ldap_add_organizational_unit(&mut ldap, "users").await?;
	ldap_add_user(&mut ldap, "user01", "MyName1").await?;
	ldap_add_user(&mut ldap, "user02", "MyName2").await?;
	ldap_add_user(&mut ldap, "user03", "MyName3").await?;

	let url = "ldap://localhost:1389/ou=users,dc=example,dc=org?displayName?one?(objectClass=inetOrgPerson)";
	let mut config = test_config();
	config.bind = Some(BindConfig {
		dn: "cn=admin,dc=example,dc=org".to_owned(),
		password: "adminpassword".to_owned(),
	});

	let native = run_search_url(&NativeDirectory::new(config.clone()), url).await;
	let ldap3 = run_search_url(&Ldap3Directory::new(config), url).await;

	for outcome in [native, ldap3] {
		let mut names: Vec<&str> =
			outcome.entries.iter().filter_map(|entry| entry.attr_first("displayName")).collect();
		names.sort_unstable();
		assert_eq!(names, ["MyName1", "MyName2", "MyName3"]);
		assert_eq!(outcome.result?.entries.len(), 3);
	}

	ldap_delete_user(&mut ldap, "user01").await?;
	ldap_delete_user(&mut ldap, "user02").await?;
	ldap_delete_user(&mut ldap, "user03").await?;
	ldap_delete_organizational_unit(&mut ldap, "users").await?;
	ldap.unbind().await?;

	Ok(())
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn ldap_search_missing_base_test() -> Result<(), Box<dyn StdError>> {
	let url = "ldap://localhost:1389/ou=nobody,dc=example,dc=org";
	let outcome = run_search_url(&NativeDirectory::new(test_config()), url).await;
	assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Protocol(ResultCode::NoSuchObject));
	Ok(())
}

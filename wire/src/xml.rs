//! Channel-zero's XML sub-language: `<greeting>`, `<profile>`, `<start>`,
//! `<close>`, `<ok/>`, `<error>`. This is a purpose-built reader for
//! exactly these six elements, not a general XML parser — the grammar is
//! closed and known ahead of time, same as the original Vortex
//! implementation's own hand-rolled greeting construction.

use std::fmt::Write as _;

use crate::error::WireError;

#[derive(Debug, Clone, Default)]
pub struct Greeting {
	pub profiles: Vec<String>,
	pub features: Option<String>,
	pub localize: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProfileOffer {
	pub uri: String,
	pub base64_content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartRequest {
	pub number: u32,
	pub server_name: Option<String>,
	pub profiles: Vec<ProfileOffer>,
}

#[derive(Debug, Clone)]
pub struct CloseRequest {
	pub number: u32,
	pub code: u32,
}

#[derive(Debug, Clone)]
pub enum ChannelZeroMessage {
	Greeting(Greeting),
	Start(StartRequest),
	Close(CloseRequest),
	Ok,
	Error { code: u32, message: String },
}

pub fn encode_greeting(greeting: &Greeting) -> String {
	let mut out = String::from("<greeting");

	if let Some(features) = &greeting.features {
		let _ = write!(out, " features='{}'", escape(features));
	}
	if let Some(localize) = &greeting.localize {
		let _ = write!(out, " localize='{}'", escape(localize));
	}

	if greeting.profiles.is_empty() {
		out.push_str(" />");
		return out;
	}

	out.push('>');
	for uri in &greeting.profiles {
		let _ = write!(out, "<profile uri='{}' />", escape(uri));
	}
	out.push_str("</greeting>");
	out
}

pub fn encode_ok() -> &'static str {
	"<ok />"
}

pub fn encode_error(code: u32, message: &str) -> String {
	format!("<error code='{code}'>{}</error>", escape(message))
}

pub fn encode_close(number: u32, code: u32) -> String {
	format!("<close number='{number}' code='{code}' />")
}

pub fn encode_start(number: u32, server_name: Option<&str>, profiles: &[ProfileOffer]) -> String {
	let mut out = format!("<start number='{number}'");
	if let Some(server_name) = server_name {
		let _ = write!(out, " serverName='{}'", escape(server_name));
	}
	out.push('>');
	for profile in profiles {
		match &profile.base64_content {
			Some(content) => {
				let _ = write!(out, "<profile uri='{}' encoding='base64'>{}</profile>", escape(&profile.uri), content);
			}
			None => {
				let _ = write!(out, "<profile uri='{}' />", escape(&profile.uri));
			}
		}
	}
	out.push_str("</start>");
	out
}

fn escape(s: &str) -> String {
	s.replace('&', "&amp;").replace('\'', "&apos;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Parse a channel-zero payload. Recognises exactly the fixed vocabulary
/// named above; anything else is a malformed-greeting error.
pub fn parse(payload: &str) -> Result<ChannelZeroMessage, WireError> {
	let trimmed = payload.trim();

	if let Some(rest) = trimmed.strip_prefix("<greeting") {
		return parse_greeting(rest);
	}
	if let Some(rest) = trimmed.strip_prefix("<start") {
		return parse_start(rest);
	}
	if let Some(rest) = trimmed.strip_prefix("<close") {
		return parse_close(rest);
	}
	if trimmed.starts_with("<ok") {
		return Ok(ChannelZeroMessage::Ok);
	}
	if let Some(rest) = trimmed.strip_prefix("<error") {
		return parse_error(rest);
	}

	Err(WireError::MalformedGreeting(format!("unrecognised channel-zero element: {trimmed:.40}")))
}

fn parse_greeting(rest: &str) -> Result<ChannelZeroMessage, WireError> {
	let (attrs, body) = split_tag(rest, "greeting")?;
	let features = attr(attrs, "features");
	let localize = attr(attrs, "localize");
	let profiles = parse_profile_uris(body);
	Ok(ChannelZeroMessage::Greeting(Greeting { profiles, features, localize }))
}

fn parse_start(rest: &str) -> Result<ChannelZeroMessage, WireError> {
	let (attrs, body) = split_tag(rest, "start")?;
	let number = attr(attrs, "number")
		.ok_or_else(|| WireError::MalformedGreeting("<start> missing number".into()))?
		.parse()
		.map_err(|_| WireError::MalformedGreeting("<start> number is not numeric".into()))?;
	let server_name = attr(attrs, "serverName");
	let profiles = parse_profile_offers(body)?;
	Ok(ChannelZeroMessage::Start(StartRequest { number, server_name, profiles }))
}

fn parse_close(rest: &str) -> Result<ChannelZeroMessage, WireError> {
	let (attrs, _) = split_tag(rest, "close")?;
	let number = attr(attrs, "number")
		.ok_or_else(|| WireError::MalformedGreeting("<close> missing number".into()))?
		.parse()
		.map_err(|_| WireError::MalformedGreeting("<close> number is not numeric".into()))?;
	let code = attr(attrs, "code")
		.ok_or_else(|| WireError::MalformedGreeting("<close> missing code".into()))?
		.parse()
		.map_err(|_| WireError::MalformedGreeting("<close> code is not numeric".into()))?;
	Ok(ChannelZeroMessage::Close(CloseRequest { number, code }))
}

fn parse_error(rest: &str) -> Result<ChannelZeroMessage, WireError> {
	let (attrs, body) = split_tag(rest, "error")?;
	let code = attr(attrs, "code")
		.ok_or_else(|| WireError::MalformedGreeting("<error> missing code".into()))?
		.parse()
		.map_err(|_| WireError::MalformedGreeting("<error> code is not numeric".into()))?;
	Ok(ChannelZeroMessage::Error { code, message: unescape(body.trim()) })
}

/// Splits `<tagSP attr='v' ...>body</tag>` or `<tag attr='v' .../>` (the
/// part after the leading `<tag`) into its attribute span and body.
fn split_tag<'a>(rest: &'a str, tag: &str) -> Result<(&'a str, &'a str), WireError> {
	let close_empty = "/>";
	let close_open = ">";

	if let Some(idx) = rest.find(close_empty) {
		if rest[..idx].find('<').is_none() {
			return Ok((&rest[..idx], ""));
		}
	}

	let gt = rest.find(close_open).ok_or_else(|| WireError::MalformedGreeting(format!("unterminated <{tag}>")))?;
	let attrs = &rest[..gt];
	let after = &rest[gt + 1..];
	let end_tag = format!("</{tag}>");
	let body = match after.rfind(&end_tag) {
		Some(end) => &after[..end],
		None => after,
	};
	Ok((attrs, body))
}

fn attr<'a>(attrs: &'a str, name: &str) -> Option<String> {
	let needle = format!("{name}='");
	let start = attrs.find(&needle)? + needle.len();
	let end = attrs[start..].find('\'')? + start;
	Some(unescape(&attrs[start..end]))
}

fn parse_profile_uris(body: &str) -> Vec<String> {
	parse_profile_offers(body).map(|offers| offers.into_iter().map(|p| p.uri).collect()).unwrap_or_default()
}

fn parse_profile_offers(body: &str) -> Result<Vec<ProfileOffer>, WireError> {
	let mut offers = Vec::new();
	let mut remaining = body;

	while let Some(start) = remaining.find("<profile") {
		let rest = &remaining[start + "<profile".len()..];
		let (attrs, content) = split_tag(rest, "profile")?;
		let uri = attr(attrs, "uri").ok_or_else(|| WireError::MalformedGreeting("<profile> missing uri".into()))?;
		let base64_content = if content.trim().is_empty() { None } else { Some(content.trim().to_string()) };
		offers.push(ProfileOffer { uri, base64_content });

		let advance = rest.find('>').map(|i| start + "<profile".len() + i + 1).unwrap_or(remaining.len());
		remaining = &remaining[advance..];
	}

	Ok(offers)
}

fn unescape(s: &str) -> String {
	s.replace("&lt;", "<").replace("&gt;", ">").replace("&apos;", "'").replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn greeting_round_trips_profile_set() {
		let greeting = Greeting { profiles: vec!["http://example.org/echo".into()], features: None, localize: None };
		let encoded = encode_greeting(&greeting);
		let ChannelZeroMessage::Greeting(parsed) = parse(&encoded).unwrap() else { panic!("expected greeting") };
		assert_eq!(parsed.profiles, greeting.profiles);
	}

	#[test]
	fn start_request_parses_number_and_profile() {
		let offers = vec![ProfileOffer { uri: "http://example.org/echo".into(), base64_content: None }];
		let encoded = encode_start(1, Some("example.org"), &offers);
		let ChannelZeroMessage::Start(parsed) = parse(&encoded).unwrap() else { panic!("expected start") };
		assert_eq!(parsed.number, 1);
		assert_eq!(parsed.server_name.as_deref(), Some("example.org"));
		assert_eq!(parsed.profiles[0].uri, "http://example.org/echo");
	}

	#[test]
	fn error_reply_parses_code_and_message() {
		let encoded = encode_error(550, "no resources");
		let ChannelZeroMessage::Error { code, message } = parse(&encoded).unwrap() else { panic!("expected error") };
		assert_eq!(code, 550);
		assert_eq!(message, "no resources");
	}

	#[test]
	fn close_request_parses_number_and_code() {
		let encoded = encode_close(3, 200);
		let ChannelZeroMessage::Close(parsed) = parse(&encoded).unwrap() else { panic!("expected close") };
		assert_eq!(parsed.number, 3);
		assert_eq!(parsed.code, 200);
	}

	#[test]
	fn unrecognised_element_is_rejected() {
		assert!(parse("<tunnel/>").is_err());
	}
}

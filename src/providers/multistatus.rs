//! WebDAV multistatus (RFC 4918 §13) parsing.
//!
//! Elements are matched by local name so `<d:href>`, `<D:href>`, `<lp1:href>`
//! and an unprefixed `<href xmlns="DAV:">` all read the same.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::ProviderError;

/// Properties of one `<response>` element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavResponse {
    pub href: String,
    pub is_collection: bool,
    pub content_length: Option<u64>,
    /// `getlastmodified` converted to RFC 3339 when it parses
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub quota_used: Option<u64>,
    pub quota_available: Option<u64>,
}

/// Parse a multistatus body into one entry per `<response>`
pub fn parse_multistatus(xml: &str) -> Result<Vec<DavResponse>, ProviderError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut responses = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "response" {
                    current = Some(DavResponse::default());
                }
                if name == "collection" && in_resourcetype(&stack) {
                    if let Some(resp) = current.as_mut() {
                        resp.is_collection = true;
                    }
                }
                stack.push(name);
                text.clear();
            }
            Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "collection" && in_resourcetype(&stack) {
                    if let Some(resp) = current.as_mut() {
                        resp.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                let raw = String::from_utf8_lossy(e.as_ref());
                match quick_xml::escape::unescape(&raw) {
                    Ok(unescaped) => text.push_str(&unescaped),
                    Err(_) => text.push_str(&raw),
                }
            }
            Ok(Event::CData(ref e)) => {
                text.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(ref e)) => {
                let entity = String::from_utf8_lossy(e.as_ref()).to_string();
                match resolve_entity(&entity) {
                    Some(c) => text.push(c),
                    None => {
                        text.push('&');
                        text.push_str(&entity);
                        text.push(';');
                    }
                }
            }
            Ok(Event::End(_)) => {
                let name = stack.pop().unwrap_or_default();
                let value = text.trim().to_string();
                text.clear();

                if name == "response" {
                    if let Some(resp) = current.take() {
                        if !resp.href.is_empty() {
                            responses.push(resp);
                        }
                    }
                    continue;
                }

                let Some(resp) = current.as_mut() else {
                    continue;
                };
                if value.is_empty() {
                    continue;
                }
                match name.as_str() {
                    // <href> also appears inside <error> and lock elements; only the direct child counts
                    "href" if stack.last().map(String::as_str) == Some("response") => {
                        resp.href = value;
                    }
                    "getcontentlength" => resp.content_length = value.parse().ok(),
                    "getlastmodified" => resp.last_modified = Some(http_date_to_rfc3339(&value)),
                    "getcontenttype" => resp.content_type = Some(value),
                    "getetag" => resp.etag = Some(value),
                    "quota-used-bytes" => resp.quota_used = value.parse().ok(),
                    "quota-available-bytes" => resp.quota_available = value.parse().ok(),
                    // DriveHQ-style servers flag collections this way
                    "iscollection" if value == "1" || value.eq_ignore_ascii_case("true") => {
                        resp.is_collection = true;
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ProviderError::ParseError(format!(
                    "multistatus at byte {}: {}",
                    reader.error_position(),
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(responses)
}

fn in_resourcetype(stack: &[String]) -> bool {
    stack.last().map(String::as_str) == Some("resourcetype")
}

fn resolve_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let num = entity.strip_prefix('#')?;
            let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// RFC 1123 date (`Wed, 21 Oct 2015 07:28:00 GMT`) to RFC 3339 UTC.
/// Unparseable values pass through unchanged.
pub fn http_date_to_rfc3339(value: &str) -> String {
    match chrono::DateTime::parse_from_rfc2822(value) {
        Ok(dt) => dt
            .with_timezone(&chrono::Utc)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEXTCLOUD: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/remote.php/dav/files/alice/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:quota-used-bytes>1000</d:quota-used-bytes>
        <d:quota-available-bytes>9000</d:quota-available-bytes>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/Tom%20%26%20Jerry.mp4</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>52428800</d:getcontentlength>
        <d:getlastmodified>Wed, 21 Oct 2015 07:28:00 GMT</d:getlastmodified>
        <d:getcontenttype>video/mp4</d:getcontenttype>
        <d:getetag>"abc"</d:getetag>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_prefixed_multistatus() {
        let responses = parse_multistatus(NEXTCLOUD).unwrap();
        assert_eq!(responses.len(), 2);

        let dir = &responses[0];
        assert!(dir.is_collection);
        assert_eq!(dir.quota_used, Some(1000));
        assert_eq!(dir.quota_available, Some(9000));

        let file = &responses[1];
        assert!(!file.is_collection);
        assert_eq!(file.href, "/remote.php/dav/files/alice/Tom%20%26%20Jerry.mp4");
        assert_eq!(file.content_length, Some(52_428_800));
        assert_eq!(file.last_modified.as_deref(), Some("2015-10-21T07:28:00Z"));
        assert_eq!(file.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(file.etag.as_deref(), Some("\"abc\""));
    }

    #[test]
    fn test_parse_default_namespace_and_entities() {
        let xml = r#"<multistatus xmlns="DAV:">
            <response>
              <href>/dav/a&amp;b/</href>
              <propstat><prop>
                <resourcetype><collection></collection></resourcetype>
              </prop></propstat>
            </response>
            <response>
              <href>/dav/caf&#233;.txt</href>
              <propstat><prop><resourcetype/><getcontentlength>3</getcontentlength></prop></propstat>
            </response>
        </multistatus>"#;
        let responses = parse_multistatus(xml).unwrap();
        assert_eq!(responses[0].href, "/dav/a&b/");
        assert!(responses[0].is_collection);
        assert_eq!(responses[1].href, "/dav/café.txt");
        assert_eq!(responses[1].content_length, Some(3));
    }

    #[test]
    fn test_collection_outside_resourcetype_ignored() {
        let xml = r#"<D:multistatus xmlns:D="DAV:"><D:response>
            <D:href>/x.txt</D:href>
            <D:propstat><D:prop><D:resourcetype/><D:displayname>collection</D:displayname></D:prop></D:propstat>
        </D:response></D:multistatus>"#;
        let responses = parse_multistatus(xml).unwrap();
        assert!(!responses[0].is_collection);
    }

    #[test]
    fn test_missing_quota_is_none() {
        let xml = r#"<d:multistatus xmlns:d="DAV:"><d:response><d:href>/</d:href>
            <d:propstat><d:prop><d:quota-used-bytes/><d:quota-available-bytes/></d:prop>
            <d:status>HTTP/1.1 404 Not Found</d:status></d:propstat></d:response></d:multistatus>"#;
        let responses = parse_multistatus(xml).unwrap();
        assert_eq!(responses[0].quota_used, None);
        assert_eq!(responses[0].quota_available, None);
    }

    #[test]
    fn test_malformed_xml_errors() {
        assert!(parse_multistatus("<d:multistatus><d:response></d:multistatus>").is_err());
    }
}

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Root element of a GMP response: its name plus the status attributes every
/// command reply carries, and the `id` attribute create commands return.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub name: String,
    pub status: String,
    pub status_text: String,
    pub id: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(&self) -> bool {
        self.status.starts_with('2')
    }

    pub fn describe(&self) -> String {
        if self.status_text.is_empty() {
            format!("status {}", self.status)
        } else {
            format!("status {}: {}", self.status, self.status_text)
        }
    }
}

pub fn envelope(xml: &str) -> Option<ResponseEnvelope> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(ResponseEnvelope {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    status: attr(&e, "status")?,
                    status_text: attr(&e, "status_text").unwrap_or_default(),
                    id: attr(&e, "id"),
                });
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

pub fn attr(e: &BytesStart, key: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == key.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Immediate text of the first element named `element`, in document order.
/// Text inside nested children is not included, so `<progress>42<host_progress>
/// …</host_progress></progress>` yields `42`.
pub fn first_child_text(xml: &str, element: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == element.as_bytes() => {
                let mut text = String::new();
                let mut depth = 0usize;
                loop {
                    match reader.read_event() {
                        Ok(Event::Start(_)) => depth += 1,
                        Ok(Event::End(_)) => {
                            if depth == 0 {
                                let trimmed = text.trim();
                                return (!trimmed.is_empty()).then(|| trimmed.to_string());
                            }
                            depth -= 1;
                        }
                        Ok(Event::Text(t)) if depth == 0 => {
                            if let Ok(t) = t.unescape() {
                                text.push_str(&t);
                            }
                        }
                        Ok(Event::CData(c)) if depth == 0 => {
                            text.push_str(&String::from_utf8_lossy(&c));
                        }
                        Ok(Event::Eof) | Err(_) => return None,
                        Ok(_) => {}
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Finds the `id` attribute of the `element` whose direct `<name>` child equals
/// `wanted`. This is how config/scanner/port-list names resolve to engine ids,
/// and how `scan-<id>` resources are rediscovered after a crash.
pub fn find_named_id(xml: &str, element: &str, wanted: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut current_id: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == element {
                    current_id = attr(&e, "id");
                }
                stack.push(name);
            }
            Ok(Event::Text(t)) => {
                let in_name = stack.len() >= 2
                    && stack[stack.len() - 1] == "name"
                    && stack[stack.len() - 2] == element;
                if in_name {
                    if let Ok(text) = t.unescape() {
                        if text.trim() == wanted {
                            return current_id;
                        }
                    }
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Returns the raw text of the first `element` subtree, tags included. Used to
/// carve the opaque report blob out of a `get_reports` response without
/// re-serializing it.
pub fn extract_element(xml: &str, element: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        let start = position(&reader);
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == element.as_bytes() => {
                let mut depth = 0usize;
                loop {
                    match reader.read_event() {
                        Ok(Event::Start(_)) => depth += 1,
                        Ok(Event::End(_)) => {
                            if depth == 0 {
                                return Some(xml[start..position(&reader)].to_string());
                            }
                            depth -= 1;
                        }
                        Ok(Event::Eof) | Err(_) => return None,
                        Ok(_) => {}
                    }
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == element.as_bytes() => {
                return Some(xml[start..position(&reader)].to_string());
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// GMP frames one XML document per command. A read buffer is a complete
/// response once it parses with every element closed; anything short of that
/// means more bytes are coming.
pub fn complete_document(buf: &[u8]) -> Option<&str> {
    let xml = std::str::from_utf8(buf).ok()?;
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut saw_root = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                depth += 1;
                saw_root = true;
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
            }
            Ok(Event::Empty(_)) => saw_root = true,
            Ok(Event::Eof) => return (saw_root && depth == 0).then_some(xml),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

fn position<R>(reader: &Reader<R>) -> usize {
    usize::try_from(reader.buffer_position()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK_RESPONSE: &str = r#"<get_tasks_response status="200" status_text="OK">
  <task id="t-1">
    <name>scan-7b0c</name>
    <status>Running</status>
    <progress>42<host_progress><host>10.0.0.5</host>42</host_progress></progress>
  </task>
</get_tasks_response>"#;

    #[test]
    fn envelope_reads_root_attributes() {
        let env = envelope(TASK_RESPONSE).unwrap();
        assert_eq!(env.name, "get_tasks_response");
        assert_eq!(env.status, "200");
        assert!(env.ok());

        let created =
            envelope(r#"<create_target_response status="201" status_text="OK, resource created" id="tgt-9"/>"#)
                .unwrap();
        assert_eq!(created.id.as_deref(), Some("tgt-9"));
        assert!(created.ok());

        let denied = envelope(r#"<authenticate_response status="400" status_text="Authentication failed"/>"#)
            .unwrap();
        assert!(!denied.ok());
        assert_eq!(denied.describe(), "status 400: Authentication failed");
    }

    #[test]
    fn child_text_skips_nested_elements() {
        assert_eq!(
            first_child_text(TASK_RESPONSE, "status").as_deref(),
            Some("Running")
        );
        assert_eq!(
            first_child_text(TASK_RESPONSE, "progress").as_deref(),
            Some("42")
        );
        assert_eq!(first_child_text(TASK_RESPONSE, "missing"), None);
    }

    #[test]
    fn named_id_lookup_matches_direct_name_children_only() {
        let xml = r#"<get_configs_response status="200">
  <config id="c-1"><name>Discovery</name></config>
  <config id="c-2"><name>Full and fast</name><nvt><name>Full and fast</name></nvt></config>
</get_configs_response>"#;
        assert_eq!(
            find_named_id(xml, "config", "Full and fast").as_deref(),
            Some("c-2")
        );
        assert_eq!(find_named_id(xml, "config", "Nonexistent"), None);
    }

    #[test]
    fn report_subtree_is_extracted_verbatim() {
        let xml = r#"<get_reports_response status="200"><report id="r-1"><owner><name>admin</name></owner><report><host><ip>10.0.0.1</ip></host></report></report></get_reports_response>"#;
        let report = extract_element(xml, "report").unwrap();
        assert!(report.starts_with(r#"<report id="r-1">"#));
        assert!(report.ends_with("</report>"));
        assert!(report.contains("<ip>10.0.0.1</ip>"));
        assert_eq!(extract_element(xml, "task"), None);
    }

    #[test]
    fn framing_detects_incomplete_documents() {
        assert!(complete_document(b"<get_version_response status=\"200\"/>").is_some());
        assert!(complete_document(b"<a><b>text</b></a>").is_some());
        assert!(complete_document(b"<a><b>text</b>").is_none());
        assert!(complete_document(b"<a att").is_none());
        assert!(complete_document(b"").is_none());
    }
}

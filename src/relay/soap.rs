use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

const ENVELOPE_NAMESPACES: &str = r#"xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:tds="http://www.onvif.org/ver10/device/wsdl" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tptz="http://www.onvif.org/ver20/ptz/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema""#;

/// Wraps a SOAP body in an envelope, with an optional WS-Security header
pub fn envelope(body: &str, security_header: Option<&str>) -> String {
    let header = security_header
        .map(|h| format!("<s:Header>\n{}\n</s:Header>\n", h))
        .unwrap_or_default();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope {}>
{}<s:Body>
{}
</s:Body>
</s:Envelope>"#,
        ENVELOPE_NAMESPACES, header, body
    )
}

/// Returns the fault reason when the response carries a SOAP Fault
pub fn find_fault(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut in_fault = false;
    let mut capture = false;
    let mut reason: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"Fault" {
                    in_fault = true;
                } else if in_fault
                    && matches!(name.as_ref(), b"Text" | b"faultstring" | b"Value")
                {
                    capture = true;
                }
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"Fault" => {
                return Some("SOAP fault".to_string());
            }
            Ok(Event::Text(t)) if capture => {
                let text = t.unescape().map(|s| s.into_owned()).unwrap_or_default();
                // Prefer the human-readable Text/faultstring over the fault code Value.
                if reason.is_none() || !text.contains(':') {
                    reason = Some(text);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"Fault" {
                    break;
                }
                capture = false;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!("Unparseable SOAP response: {}", e);
                return None;
            }
            _ => {}
        }
        buf.clear();
    }

    if in_fault {
        Some(reason.unwrap_or_else(|| "SOAP fault".to_string()))
    } else {
        None
    }
}

/// Attributes of the first element with the given local name
pub fn element_attributes(xml: &str, local_name: &str) -> Option<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == local_name.as_bytes() =>
            {
                return Some(collect_attributes(&e));
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Text content of elements by local name (first occurrence wins)
pub fn element_texts(xml: &str, local_names: &[&str]) -> HashMap<String, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut texts = HashMap::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                current = local_names.contains(&name.as_str()).then_some(name);
            }
            Ok(Event::Text(t)) => {
                if let Some(name) = current.take() {
                    let text = t.unescape().map(|s| s.into_owned()).unwrap_or_default();
                    texts.entry(name).or_insert(text);
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    texts
}

fn collect_attributes(e: &BytesStart<'_>) -> HashMap<String, String> {
    e.attributes()
        .flatten()
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
            let value = attr
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_default();
            (key, value)
        })
        .collect()
}

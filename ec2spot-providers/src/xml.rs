use ec2spot_common::{Result, SpotError};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Owned element tree for EC2 query responses.
///
/// Element names are stored without namespace prefix, so paths are written
/// with local names only (`spotInstanceRequestSet/item/state`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    stack.push(XmlElement::new(&local_name(e.local_name().as_ref())?));
                }
                Ok(Event::Empty(e)) => {
                    let el = XmlElement::new(&local_name(e.local_name().as_ref())?);
                    attach(&mut stack, &mut root, el)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| SpotError::Xml(e.to_string()))?;
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    let raw = c.into_inner();
                    let text = std::str::from_utf8(&raw).map_err(|e| SpotError::Xml(e.to_string()))?;
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(text);
                    }
                }
                Ok(Event::End(_)) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| SpotError::Xml("unbalanced closing tag".to_string()))?;
                    attach(&mut stack, &mut root, el)?;
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(SpotError::Xml(format!(
                        "at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(SpotError::Xml(format!("unclosed element <{}>", stack[stack.len() - 1].name)));
        }
        root.ok_or_else(|| SpotError::Xml("empty document".to_string()))
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First element matching a slash-separated path relative to `self`.
    pub fn find(&self, path: &str) -> Option<&XmlElement> {
        self.find_all(path).into_iter().next()
    }

    /// All elements matching a slash-separated path, in document order.
    pub fn find_all(&self, path: &str) -> Vec<&XmlElement> {
        let mut current: Vec<&XmlElement> = vec![self];
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .into_iter()
                .flat_map(|el| el.children.iter().filter(move |c| c.name == segment))
                .collect();
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// Text of the first element at `path`; `None` when the element is
    /// missing or empty.
    pub fn find_text(&self, path: &str) -> Option<&str> {
        self.find(path)
            .map(|el| el.text.trim())
            .filter(|t| !t.is_empty())
    }

    /// EC2 reports failures as `<Response><Errors><Error>` documents.
    pub fn provider_error(&self) -> Option<SpotError> {
        let error = self.find("Errors/Error")?;
        Some(SpotError::Provider {
            code: error.find_text("Code").unwrap_or("Unknown").to_string(),
            message: error.find_text("Message").unwrap_or_default().to_string(),
        })
    }
}

fn local_name(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(|s| s.to_string())
        .map_err(|e| SpotError::Xml(e.to_string()))
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, el: XmlElement) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(el);
        return Ok(());
    }
    if root.is_some() {
        return Err(SpotError::Xml("multiple root elements".to_string()));
    }
    *root = Some(el);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIBE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeSpotInstanceRequestsResponse xmlns="http://ec2.amazonaws.com/doc/2013-10-15/">
  <requestId>59dbff89-35bd-4eac-99ed-be587EXAMPLE</requestId>
  <spotInstanceRequestSet>
    <item>
      <spotInstanceRequestId>sir-1a2b3c4d</spotInstanceRequestId>
      <state>open</state>
    </item>
    <item>
      <spotInstanceRequestId>sir-5e6f7a8b</spotInstanceRequestId>
      <state>active</state>
      <instanceId/>
    </item>
  </spotInstanceRequestSet>
</DescribeSpotInstanceRequestsResponse>"#;

    #[test]
    fn parses_nested_sets() {
        let root = XmlElement::parse(DESCRIBE).unwrap();
        assert_eq!(root.name, "DescribeSpotInstanceRequestsResponse");
        let items = root.find_all("spotInstanceRequestSet/item");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].find_text("spotInstanceRequestId"), Some("sir-1a2b3c4d"));
        assert_eq!(items[1].find_text("state"), Some("active"));
        // Present but empty element reads as absent text.
        assert!(items[1].find("instanceId").is_some());
        assert_eq!(items[1].find_text("instanceId"), None);
        assert!(root.find("spotInstanceRequestSet/item/nope").is_none());
    }

    #[test]
    fn strips_namespace_prefixes_and_unescapes() {
        let root = XmlElement::parse(
            r#"<ec2:Root xmlns:ec2="urn:x"><ec2:message>a &amp; b</ec2:message><data><![CDATA[<raw>]]></data></ec2:Root>"#,
        )
        .unwrap();
        assert_eq!(root.name, "Root");
        assert_eq!(root.find_text("message"), Some("a & b"));
        assert_eq!(root.find_text("data"), Some("<raw>"));
    }

    #[test]
    fn reports_provider_errors() {
        let root = XmlElement::parse(
            "<Response><Errors><Error><Code>AuthFailure</Code><Message>denied</Message></Error></Errors><RequestID>x</RequestID></Response>",
        )
        .unwrap();
        match root.provider_error() {
            Some(SpotError::Provider { code, message }) => {
                assert_eq!(code, "AuthFailure");
                assert_eq!(message, "denied");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(XmlElement::parse(DESCRIBE).unwrap().provider_error().is_none());
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(XmlElement::parse(""), Err(SpotError::Xml(_))));
        assert!(matches!(XmlElement::parse("<a><b></a>"), Err(SpotError::Xml(_))));
        assert!(matches!(XmlElement::parse("<a>"), Err(SpotError::Xml(_))));
    }
}

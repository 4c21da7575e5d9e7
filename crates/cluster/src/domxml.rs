use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// MAC address of the domain interface attached to `bridge`.
///
/// Scans the domain XML for `<interface>` elements whose `<source>`
/// names the bridge (live XML carries the resolved `bridge` attribute,
/// defined-only XML the `network` attribute) and returns the lowercased
/// `<mac address=.../>` of the first match.
pub fn interface_mac_on_bridge(xml: &str, bridge: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut in_interface = false;
    let mut mac: Option<String> = None;
    let mut on_bridge = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"interface" => {
                    in_interface = true;
                    mac = None;
                    on_bridge = false;
                }
                b"source" if in_interface => {
                    if attr_value(&e, b"bridge").as_deref() == Some(bridge)
                        || attr_value(&e, b"network").as_deref() == Some(bridge)
                    {
                        on_bridge = true;
                    }
                }
                b"mac" if in_interface => {
                    mac = attr_value(&e, b"address").map(|m| m.to_lowercase());
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.name().as_ref() == b"interface" => {
                if on_bridge && mac.is_some() {
                    return mac;
                }
                in_interface = false;
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Host-side device names (`<target dev=.../>`) of all domain interfaces.
pub fn interface_target_devs(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    let mut in_interface = false;
    let mut devs = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"interface" => in_interface = true,
                b"target" if in_interface => {
                    if let Some(dev) = attr_value(&e, b"dev") {
                        devs.push(dev);
                    }
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.name().as_ref() == b"interface" => in_interface = false,
            Ok(Event::Eof) | Err(_) => return devs,
            _ => {}
        }
    }
}

fn attr_value(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
}

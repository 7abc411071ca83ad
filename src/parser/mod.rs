//! Parsing of nmap's XML output (`-oX -`) into a [`ScanResult`].
//!
//! The parser is total: any input either yields a result or a
//! [`ParseError`], it never panics. A parse error on output from a
//! successful attempt is reported separately from a process error.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Root element of nmap's machine-readable output.
const ROOT_ELEMENT: &str = "nmaprun";

/// OS guesses shown per host in the summary.
const SUMMARY_OS_GUESSES: usize = 3;

/// Errors produced while parsing command output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("output is empty")]
    Empty,

    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: u64, message: String },

    #[error("unexpected root element '{0}', expected '{ROOT_ELEMENT}'")]
    UnexpectedRoot(String),

    #[error("unexpected content outside the root element")]
    ContentOutsideRoot,

    #[error("output ended before the document was closed")]
    Truncated,

    #[error("invalid value '{value}' for attribute '{attribute}' on <{element}>")]
    InvalidAttribute {
        element: String,
        attribute: String,
        value: String,
    },
}

/// Structured result of a scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_info: ScanInfo,
    pub hosts: Vec<Host>,
    /// Human-readable summary of hosts and open ports.
    pub summary: String,
}

impl ScanResult {
    /// Find a port entry by number on any host.
    pub fn find_port(&self, port: u16) -> Option<&Port> {
        self.hosts
            .iter()
            .flat_map(|h| h.ports.iter())
            .find(|p| p.port == port)
    }

    /// All ports reported open, across hosts.
    pub fn open_ports(&self) -> impl Iterator<Item = &Port> {
        self.hosts
            .iter()
            .flat_map(|h| h.ports.iter())
            .filter(|p| p.is_open())
    }
}

/// Run-level information from `<nmaprun>` and `<runstats>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    pub scanner: String,
    pub args: String,
    pub start_time: String,
    pub xml_version: String,
    pub end_time: Option<String>,
    pub elapsed: Option<String>,
    pub hosts_up: Option<u32>,
    pub hosts_down: Option<u32>,
    pub hosts_total: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub status: String,
    pub addresses: Vec<Address>,
    pub hostnames: Vec<Hostname>,
    pub ports: Vec<Port>,
    pub os_matches: Vec<OsMatch>,
    pub host_scripts: Vec<ScriptOutput>,
    /// e.g. `22/tcp (ssh), 80/tcp (http)`.
    pub open_ports_summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub addr: String,
    #[serde(rename = "type")]
    pub addr_type: String,
    pub vendor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hostname {
    pub name: String,
    #[serde(rename = "type")]
    pub name_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub reason: String,
    pub service: Option<Service>,
    pub scripts: Vec<ScriptOutput>,
}

impl Port {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }

    fn service_name(&self) -> &str {
        self.service
            .as_ref()
            .map(|s| s.name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub product: String,
    pub version: String,
    pub extra_info: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsMatch {
    pub name: String,
    pub accuracy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptOutput {
    pub id: String,
    pub output: String,
}

/// Parse raw nmap XML into a [`ScanResult`].
pub fn parse_scan_output(raw: &str) -> Result<ScanResult, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);

    let mut builder = ResultBuilder::default();

    loop {
        let event = reader.read_event().map_err(|e| ParseError::Malformed {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(e) => {
                builder.open(&e)?;
                builder.depth += 1;
            }
            Event::Empty(e) => {
                builder.open(&e)?;
                builder.close(&element_name(&e));
            }
            Event::End(e) => {
                builder.depth = builder.depth.checked_sub(1).ok_or(ParseError::ContentOutsideRoot)?;
                builder.close(&String::from_utf8_lossy(e.name().as_ref()));
            }
            Event::Text(_) | Event::CData(_) if builder.depth == 0 => {
                return Err(ParseError::ContentOutsideRoot);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    builder.finish()
}

/// Which part of a `<host>` the reader is inside.
#[derive(Default)]
struct HostSections {
    os: bool,
    hostscript: bool,
}

#[derive(Default)]
struct ResultBuilder {
    depth: usize,
    saw_root: bool,
    info: ScanInfo,
    hosts: Vec<Host>,
    host: Option<Host>,
    port: Option<Port>,
    sections: HostSections,
    in_runstats: bool,
}

impl ResultBuilder {
    fn open(&mut self, e: &BytesStart<'_>) -> Result<(), ParseError> {
        let name = element_name(e);

        if self.depth == 0 {
            if self.saw_root {
                return Err(ParseError::ContentOutsideRoot);
            }
            if name != ROOT_ELEMENT {
                return Err(ParseError::UnexpectedRoot(name));
            }
            self.saw_root = true;
            let mut attrs = attributes(e)?;
            self.info.scanner = attrs.remove("scanner").unwrap_or_else(|| "nmap".to_string());
            self.info.args = attrs.remove("args").unwrap_or_default();
            self.info.start_time = attrs.remove("startstr").unwrap_or_default();
            self.info.xml_version = attrs.remove("xmloutputversion").unwrap_or_default();
            return Ok(());
        }

        match name.as_str() {
            "host" => self.host = Some(Host::default()),
            "runstats" => self.in_runstats = true,
            "finished" if self.in_runstats => {
                let mut attrs = attributes(e)?;
                self.info.end_time = attrs.remove("timestr");
                self.info.elapsed = attrs.remove("elapsed");
            }
            "hosts" if self.in_runstats => {
                let mut attrs = attributes(e)?;
                self.info.hosts_up = parse_count(&name, "up", attrs.remove("up"))?;
                self.info.hosts_down = parse_count(&name, "down", attrs.remove("down"))?;
                self.info.hosts_total = parse_count(&name, "total", attrs.remove("total"))?;
            }
            _ => self.open_in_host(&name, e)?,
        }
        Ok(())
    }

    fn open_in_host(&mut self, name: &str, e: &BytesStart<'_>) -> Result<(), ParseError> {
        let Some(host) = self.host.as_mut() else {
            return Ok(());
        };

        if let Some(port) = self.port.as_mut() {
            let mut attrs = attributes(e)?;
            match name {
                "state" => {
                    port.state = attrs.remove("state").unwrap_or_default();
                    port.reason = attrs.remove("reason").unwrap_or_default();
                }
                "service" => {
                    port.service = Some(Service {
                        name: attrs.remove("name").unwrap_or_default(),
                        product: attrs.remove("product").unwrap_or_default(),
                        version: attrs.remove("version").unwrap_or_default(),
                        extra_info: attrs.remove("extrainfo").unwrap_or_default(),
                    });
                }
                "script" => port.scripts.push(script_output(attrs)),
                _ => {}
            }
            return Ok(());
        }

        match name {
            "status" => {
                host.status = attributes(e)?
                    .remove("state")
                    .unwrap_or_else(|| "unknown".to_string());
            }
            "address" => {
                let mut attrs = attributes(e)?;
                host.addresses.push(Address {
                    addr: attrs.remove("addr").unwrap_or_default(),
                    addr_type: attrs.remove("addrtype").unwrap_or_default(),
                    vendor: attrs.remove("vendor").unwrap_or_default(),
                });
            }
            "hostname" => {
                let mut attrs = attributes(e)?;
                host.hostnames.push(Hostname {
                    name: attrs.remove("name").unwrap_or_default(),
                    name_type: attrs.remove("type").unwrap_or_default(),
                });
            }
            "port" => {
                let mut attrs = attributes(e)?;
                let raw_port = attrs.remove("portid").unwrap_or_default();
                let port = raw_port
                    .parse::<u16>()
                    .map_err(|_| ParseError::InvalidAttribute {
                        element: "port".to_string(),
                        attribute: "portid".to_string(),
                        value: raw_port.clone(),
                    })?;
                self.port = Some(Port {
                    port,
                    protocol: attrs.remove("protocol").unwrap_or_default(),
                    ..Port::default()
                });
            }
            "os" => self.sections.os = true,
            "osmatch" if self.sections.os => {
                let mut attrs = attributes(e)?;
                host.os_matches.push(OsMatch {
                    name: attrs.remove("name").unwrap_or_default(),
                    accuracy: attrs.remove("accuracy").unwrap_or_default(),
                });
            }
            "hostscript" => self.sections.hostscript = true,
            "script" if self.sections.hostscript => {
                host.host_scripts.push(script_output(attributes(e)?));
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &str) {
        match name {
            "port" => {
                if let (Some(host), Some(port)) = (self.host.as_mut(), self.port.take()) {
                    host.ports.push(port);
                }
            }
            "os" => self.sections.os = false,
            "hostscript" => self.sections.hostscript = false,
            "runstats" => self.in_runstats = false,
            "host" => {
                if let Some(mut host) = self.host.take() {
                    host.open_ports_summary = open_ports_summary(&host);
                    self.hosts.push(host);
                }
                self.port = None;
                self.sections = HostSections::default();
            }
            _ => {}
        }
    }

    fn finish(self) -> Result<ScanResult, ParseError> {
        if !self.saw_root {
            return Err(ParseError::Empty);
        }
        if self.depth != 0 {
            return Err(ParseError::Truncated);
        }

        let summary = summarize(&self.info, &self.hosts);
        Ok(ScanResult {
            scan_info: self.info,
            hosts: self.hosts,
            summary,
        })
    }
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>, ParseError> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ParseError::Malformed {
            position: 0,
            message: err.to_string(),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attr.value);
        let value = quick_xml::escape::unescape(&raw)
            .map_err(|err| ParseError::Malformed {
                position: 0,
                message: err.to_string(),
            })?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn parse_count(
    element: &str,
    attribute: &str,
    value: Option<String>,
) -> Result<Option<u32>, ParseError> {
    match value {
        None => Ok(None),
        Some(v) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ParseError::InvalidAttribute {
                element: element.to_string(),
                attribute: attribute.to_string(),
                value: v,
            }),
    }
}

fn script_output(mut attrs: HashMap<String, String>) -> ScriptOutput {
    ScriptOutput {
        id: attrs.remove("id").unwrap_or_default(),
        output: attrs.remove("output").unwrap_or_default(),
    }
}

fn open_ports_summary(host: &Host) -> String {
    host.ports
        .iter()
        .filter(|p| p.is_open())
        .map(|p| format!("{}/{} ({})", p.port, p.protocol, p.service_name()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn summarize(info: &ScanInfo, hosts: &[Host]) -> String {
    let count = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string());

    let mut parts = vec![format!(
        "Nmap scan completed. {} host(s) up out of {} scanned.",
        count(info.hosts_up),
        count(info.hosts_total)
    )];

    for (i, host) in hosts.iter().enumerate() {
        let mut label = host
            .addresses
            .iter()
            .map(|a| a.addr.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let names = host
            .hostnames
            .iter()
            .map(|h| h.name.as_str())
            .filter(|n| !n.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        if !names.is_empty() {
            label.push_str(&format!(" ({})", names));
        }
        let status = if host.status.is_empty() { "?" } else { &host.status };

        parts.push(format!("\nHost {}: {} [{}]", i + 1, label, status));
        if host.open_ports_summary.is_empty() {
            parts.push("  No open ports found.".to_string());
        } else {
            parts.push(format!("  Open ports: {}", host.open_ports_summary));
        }
        for os in host.os_matches.iter().take(SUMMARY_OS_GUESSES) {
            parts.push(format!("  OS guess: {} ({}% accuracy)", os.name, os.accuracy));
        }
    }

    parts.join("\n")
}

// src/nat/ice/sdp.rs
//! Minimal SDP blob for exchanging ICE parameters out of band
//!
//! Only what ICE needs is written or read: credentials, `ice-lite`, one
//! `m=` section per stream and its `a=candidate` lines. Anything else in a
//! parsed document is ignored.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::nat::error::IceError;
use super::candidate::Candidate;

/// One stream of a session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// Media token of the `m=` line
    pub name: String,
    /// Component count
    pub components: u16,
    /// Candidates of every component
    pub candidates: Vec<Candidate>,
}

impl MediaDescription {
    /// Candidate used for the `m=`/`c=` defaults: highest priority of component 1
    fn default_candidate(&self) -> Option<&Candidate> {
        self.candidates
            .iter()
            .filter(|c| c.component_id == 1)
            .max_by_key(|c| c.priority)
    }
}

/// ICE parameters of one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// ice-ufrag
    pub ufrag: String,
    /// ice-pwd
    pub pwd: String,
    /// ice-lite
    pub lite: bool,
    /// One entry per stream
    pub media: Vec<MediaDescription>,
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = self
            .media
            .iter()
            .find_map(|m| m.default_candidate())
            .map(|c| c.address.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        writeln!(f, "v=0")?;
        writeln!(f, "o=- 0 0 IN {} {}", ip_kind(&origin), origin)?;
        writeln!(f, "s=-")?;
        writeln!(f, "t=0 0")?;
        if self.lite {
            writeln!(f, "a=ice-lite")?;
        }
        writeln!(f, "a=ice-ufrag:{}", self.ufrag)?;
        writeln!(f, "a=ice-pwd:{}", self.pwd)?;

        for media in &self.media {
            let (ip, port) = media
                .default_candidate()
                .map(|c| (c.address.ip(), c.address.port()))
                .unwrap_or((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9));
            writeln!(f, "m={} {} RTP/AVP 0", media.name, port)?;
            writeln!(f, "c=IN {} {}", ip_kind(&ip), ip)?;
            for candidate in &media.candidates {
                writeln!(f, "a={}", candidate.to_sdp_attribute())?;
            }
        }
        Ok(())
    }
}

fn ip_kind(ip: &IpAddr) -> &'static str {
    if ip.is_ipv4() { "IP4" } else { "IP6" }
}

impl FromStr for SessionDescription {
    type Err = IceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ufrag = None;
        let mut pwd = None;
        let mut lite = false;
        let mut media: Vec<MediaDescription> = Vec::new();

        for line in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(m) = line.strip_prefix("m=") {
                let name = m
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| IceError::Sdp("empty m= line".to_string()))?;
                media.push(MediaDescription { name: name.to_string(), components: 1, candidates: Vec::new() });
            } else if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
                ufrag = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
                pwd = Some(value.to_string());
            } else if line == "a=ice-lite" {
                lite = true;
            } else if line.starts_with("a=candidate:") {
                let candidate = Candidate::from_sdp_attribute(line)?;
                let current = media
                    .last_mut()
                    .ok_or_else(|| IceError::Sdp("candidate outside of a media section".to_string()))?;
                current.components = current.components.max(candidate.component_id);
                current.candidates.push(candidate);
            }
        }

        Ok(Self {
            ufrag: ufrag.ok_or_else(|| IceError::Sdp("missing a=ice-ufrag".to_string()))?,
            pwd: pwd.ok_or_else(|| IceError::Sdp("missing a=ice-pwd".to_string()))?,
            lite,
            media,
        })
    }
}

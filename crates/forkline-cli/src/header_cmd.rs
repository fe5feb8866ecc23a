//! Header subcommands: encode, decode.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};

use forkline_core::RoutingHeader;

/// Header subcommand actions.
#[derive(clap::Subcommand, Debug)]
pub enum HeaderAction {
    /// Print the hex wire encoding of a routing header.
    Encode {
        /// Group id.
        group: String,
        /// Member id.
        member: String,
    },
    /// Decode a hex routing header and print it as `group:member`.
    Decode {
        /// Hex-encoded header bytes.
        hex: String,
    },
}

/// Execute a header subcommand.
pub fn run(action: HeaderAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        HeaderAction::Encode { group, member } => {
            writeln!(out, "{}", encode_hex(group, member)?)?;
        }
        HeaderAction::Decode { hex } => {
            writeln!(out, "{}", decode_hex(&hex)?)?;
        }
    }
    Ok(())
}

fn encode_hex(group: String, member: String) -> anyhow::Result<String> {
    let hdr = RoutingHeader::new(group, member);
    let mut buf = Vec::with_capacity(hdr.encoded_len());
    hdr.encode(&mut buf)?;
    Ok(hex::encode(buf))
}

fn decode_hex(input: &str) -> anyhow::Result<RoutingHeader> {
    let raw = hex::decode(input.trim())?;
    let mut buf = raw.as_slice();
    let hdr = RoutingHeader::decode(&mut buf)?;
    if !buf.is_empty() {
        anyhow::bail!("{} trailing bytes after routing header", buf.len());
    }
    Ok(hdr)
}

// References:
// https://www.kernel.org/doc/html/latest/networking/filter.html
// https://www.tcpdump.org/manpages/tcpdump.1.html (-ddd)

//! Classic BPF capture filters, attached to a socket with SO_ATTACH_FILTER.

use std::os::fd::AsFd;
use std::process::Command;

use log::debug;
use socket2::SockRef;

use crate::error::{Error, Result};

/// Kernel limit on classic BPF program length.
const MAX_INSNS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Insn {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BpfProgram {
    insns: Vec<Insn>,
}

impl BpfProgram {
    /// Parse decimal bytecode as printed by `tcpdump -ddd`: an instruction
    /// count followed by `code jt jf k` quadruples, separated by newlines or
    /// commas.
    pub fn from_bytecode(text: &str) -> Result<Self> {
        let mut lines = text
            .split(|c: char| c == ',' || c == '\n')
            .map(str::trim)
            .filter(|line| !line.is_empty());

        let count: usize = lines
            .next()
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| Error::filter("missing instruction count"))?;
        if count == 0 || count > MAX_INSNS {
            return Err(Error::filter(format!("{} instructions", count)));
        }

        let insns = lines.map(parse_insn).collect::<Result<Vec<_>>>()?;
        if insns.len() != count {
            return Err(Error::filter(format!(
                "expected {} instructions, found {}",
                count,
                insns.len()
            )));
        }
        Ok(Self { insns })
    }

    /// Compile a pcap filter expression with tcpdump.
    pub fn compile(expression: &str) -> Result<Self> {
        let output = Command::new("tcpdump")
            .args(["-ddd", "-y", "EN10MB", "--", expression])
            .output()
            .map_err(|e| Error::filter(format!("could not run tcpdump: {}", e)))?;
        if !output.status.success() {
            return Err(Error::filter(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        let program = Self::from_bytecode(&String::from_utf8_lossy(&output.stdout))?;
        debug!("Compiled '{}' into {} instruction(s)", expression, program.insns.len());
        Ok(program)
    }

    /// Bytecode if `text` reads as such, a filter expression otherwise.
    pub fn from_filter(text: &str) -> Result<Self> {
        if text.trim_start().starts_with(|c: char| c.is_ascii_digit()) {
            Self::from_bytecode(text)
        } else {
            Self::compile(text)
        }
    }

    /// Replace the socket's filter with this program.
    pub fn attach<S: AsFd>(&self, socket: &S) -> std::io::Result<()> {
        let filters: Vec<libc::sock_filter> = self
            .insns
            .iter()
            .map(|insn| libc::sock_filter {
                code: insn.code,
                jt: insn.jt,
                jf: insn.jf,
                k: insn.k,
            })
            .collect();
        SockRef::from(socket).attach_filter(&filters)
    }
}

fn parse_insn(line: &str) -> Result<Insn> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let &[code, jt, jf, k] = fields.as_slice() else {
        return Err(Error::filter(format!("malformed instruction '{}'", line)));
    };
    let bad = |_| Error::filter(format!("malformed instruction '{}'", line));
    Ok(Insn {
        code: code.parse().map_err(bad)?,
        jt: jt.parse().map_err(bad)?,
        jf: jf.parse().map_err(bad)?,
        k: k.parse().map_err(bad)?,
    })
}

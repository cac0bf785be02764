//! Locating USDT probe sites in a target binary.
//!
//! SystemTap-style probes leave one ELF note per site in `.note.stapsdt`:
//!
//! ```text
//!   u64 pc | u64 base | u64 semaphore | provider\0 | name\0 | args\0
//! ```
//!
//! `args` describes where each argument lives at the probe instruction,
//! e.g. `8@%rdi -4@%eax 8@-64(%rbp)`. The probe program cannot interpret
//! those strings, so they are turned into a [`UsdtSpec`] here and handed
//! over through a global.

use std::path::Path;

use log::debug;
use object::elf::{EM_X86_64, FileHeader64};
use object::read::elf::{FileHeader, SectionHeader};
use object::{Endian, Endianness, FileKind};
use upcall_ebpf_common::{USDT_MAX_ARGS, UsdtArgSpec, UsdtSpec, usdt_arg};

use crate::error::ProbeAttachError;

const NOTE_SECTION: &[u8] = b".note.stapsdt";
const BASE_SECTION: &[u8] = b".stapsdt.base";
const NOTE_NAME: &[u8] = b"stapsdt";
const NT_STAPSDT: u32 = 3;

/// One probe site, resolved to something a uprobe can attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSite {
    pub provider: String,
    pub name: String,
    /// Link-time address of the probe instruction, after base adjustment.
    pub pc: u64,
    /// Offset of the probe instruction in the file.
    pub file_offset: u64,
    /// Address of the enabling semaphore, 0 if the site has none.
    pub semaphore: u64,
    pub args: String,
    pub spec: UsdtSpec,
}

#[derive(Debug, PartialEq, Eq)]
struct RawNote<'a> {
    pc: u64,
    base: u64,
    semaphore: u64,
    provider: &'a str,
    name: &'a str,
    args: &'a str,
}

fn elf_err(path: &Path, err: impl std::fmt::Display) -> ProbeAttachError {
    ProbeAttachError::Elf {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Every `provider:name` site in the ELF image `data`.
///
/// A binary without the note section, or without a matching note, yields
/// [`ProbeAttachError::ProbeNotFound`].
pub fn find_probes(
    data: &[u8],
    path: &Path,
    provider: &str,
    name: &str,
) -> Result<Vec<ProbeSite>, ProbeAttachError> {
    match FileKind::parse(data).map_err(|e| elf_err(path, e))? {
        FileKind::Elf64 => {}
        FileKind::Elf32 => return Err(ProbeAttachError::UnsupportedArch("32-bit ELF".into())),
        other => return Err(elf_err(path, format!("not an ELF binary ({other:?})"))),
    }

    let header = FileHeader64::<Endianness>::parse(data).map_err(|e| elf_err(path, e))?;
    let endian = header.endian().map_err(|e| elf_err(path, e))?;
    let machine = header.e_machine(endian);
    if machine != EM_X86_64 {
        return Err(ProbeAttachError::UnsupportedArch(format!(
            "ELF machine {machine}"
        )));
    }
    let sections = header
        .sections(endian, data)
        .map_err(|e| elf_err(path, e))?;

    let not_found = || ProbeAttachError::ProbeNotFound {
        provider: provider.to_string(),
        probe: name.to_string(),
        binary: path.to_path_buf(),
    };

    let base_addr = sections
        .section_by_name(endian, BASE_SECTION)
        .map(|(_, s)| s.sh_addr(endian));
    let (_, notes_section) = sections
        .section_by_name(endian, NOTE_SECTION)
        .ok_or_else(not_found)?;
    let mut notes = notes_section
        .notes(endian, data)
        .map_err(|e| elf_err(path, e))?
        .ok_or_else(not_found)?;

    let mut sites = Vec::new();
    while let Some(note) = notes.next().map_err(|e| elf_err(path, e))? {
        if note.name() != NOTE_NAME || note.n_type(endian) != NT_STAPSDT {
            continue;
        }
        let Some(raw) = parse_note_desc(note.desc(), endian) else {
            debug!("skipping malformed stapsdt note in {}", path.display());
            continue;
        };
        if raw.provider != provider || raw.name != name {
            continue;
        }

        let mut pc = raw.pc;
        if let Some(actual) = base_addr {
            // Prelinked or relocated binaries move .stapsdt.base; the note
            // keeps the link-time value.
            pc = pc.wrapping_add(actual).wrapping_sub(raw.base);
        }

        let file_offset = sections
            .iter()
            .find_map(|s| {
                let addr = s.sh_addr(endian);
                let size = s.sh_size(endian);
                (s.sh_type(endian) == object::elf::SHT_PROGBITS
                    && addr <= pc
                    && pc < addr + size)
                    .then(|| pc - addr + s.sh_offset(endian))
            })
            .ok_or_else(|| {
                elf_err(
                    path,
                    format!("probe address {pc:#x} is not inside any section"),
                )
            })?;

        sites.push(ProbeSite {
            provider: raw.provider.to_string(),
            name: raw.name.to_string(),
            pc,
            file_offset,
            semaphore: raw.semaphore,
            args: raw.args.to_string(),
            spec: parse_arg_spec(raw.args)?,
        });
    }

    if sites.is_empty() {
        return Err(not_found());
    }
    Ok(sites)
}

fn parse_note_desc(desc: &[u8], endian: Endianness) -> Option<RawNote<'_>> {
    let word = |i: usize| -> Option<u64> {
        let bytes: [u8; 8] = desc.get(i * 8..i * 8 + 8)?.try_into().ok()?;
        Some(endian.read_u64_bytes(bytes))
    };
    let pc = word(0)?;
    let base = word(1)?;
    let semaphore = word(2)?;

    let mut strings = desc.get(24..)?.split(|&b| b == 0);
    let mut next = || std::str::from_utf8(strings.next()?).ok();
    let provider = next()?;
    let name = next()?;
    let args = next().unwrap_or("");

    Some(RawNote {
        pc,
        base,
        semaphore,
        provider,
        name,
        args,
    })
}

/// Offset of an x86-64 register inside `struct pt_regs`, for any of its
/// sub-register names.
fn pt_regs_offset(reg: &str) -> Option<u32> {
    let off = match reg {
        "r15" | "r15d" | "r15w" | "r15b" => 0,
        "r14" | "r14d" | "r14w" | "r14b" => 8,
        "r13" | "r13d" | "r13w" | "r13b" => 16,
        "r12" | "r12d" | "r12w" | "r12b" => 24,
        "rbp" | "ebp" | "bp" | "bpl" => 32,
        "rbx" | "ebx" | "bx" | "bl" | "bh" => 40,
        "r11" | "r11d" | "r11w" | "r11b" => 48,
        "r10" | "r10d" | "r10w" | "r10b" => 56,
        "r9" | "r9d" | "r9w" | "r9b" => 64,
        "r8" | "r8d" | "r8w" | "r8b" => 72,
        "rax" | "eax" | "ax" | "al" | "ah" => 80,
        "rcx" | "ecx" | "cx" | "cl" | "ch" => 88,
        "rdx" | "edx" | "dx" | "dl" | "dh" => 96,
        "rsi" | "esi" | "si" | "sil" => 104,
        "rdi" | "edi" | "di" | "dil" => 112,
        "rip" => 128,
        "rsp" | "esp" | "sp" | "spl" => 152,
        _ => return None,
    };
    Some(off)
}

/// Decode an x86-64 argument string into the probe program's spec.
pub fn parse_arg_spec(args: &str) -> Result<UsdtSpec, ProbeAttachError> {
    let fail = |reason: String| ProbeAttachError::ArgSpec {
        args: args.to_string(),
        reason,
    };

    let mut spec = UsdtSpec::zeroed();
    for (idx, token) in args.split_whitespace().enumerate() {
        if idx >= USDT_MAX_ARGS {
            return Err(fail(format!("more than {USDT_MAX_ARGS} arguments")));
        }
        spec.args[idx] = parse_arg(token).map_err(fail)?;
        spec.arg_cnt = idx as u32 + 1;
    }
    Ok(spec)
}

fn parse_arg(token: &str) -> Result<UsdtArgSpec, String> {
    let (size, loc) = token
        .split_once('@')
        .ok_or_else(|| format!("argument \"{token}\" has no size prefix"))?;
    let size: i32 = size
        .parse()
        .map_err(|_| format!("bad argument size in \"{token}\""))?;
    let bytes = size.unsigned_abs();
    if !matches!(bytes, 1 | 2 | 4 | 8) {
        return Err(format!("unsupported argument size {size} in \"{token}\""));
    }

    let mut arg = UsdtArgSpec::zeroed();
    arg.signed = u32::from(size < 0);
    arg.bitshift = 64 - bytes * 8;

    if let Some(imm) = loc.strip_prefix('$') {
        arg.kind = usdt_arg::CONST;
        arg.val_off = imm
            .parse()
            .map_err(|_| format!("bad immediate in \"{token}\""))?;
    } else if let Some(reg) = loc.strip_prefix('%') {
        arg.kind = usdt_arg::REG;
        arg.reg_off =
            pt_regs_offset(reg).ok_or_else(|| format!("unknown register %{reg}"))?;
    } else if let Some((off, rest)) = loc.split_once("(%") {
        let reg = rest
            .strip_suffix(')')
            .ok_or_else(|| format!("unterminated memory operand \"{token}\""))?;
        if reg.contains(',') {
            return Err(format!("indexed memory operand \"{token}\" is not supported"));
        }
        arg.kind = usdt_arg::REG_DEREF;
        arg.reg_off =
            pt_regs_offset(reg).ok_or_else(|| format!("unknown register %{reg}"))?;
        arg.val_off = if off.is_empty() {
            0
        } else {
            off.parse()
                .map_err(|_| format!("bad displacement in \"{token}\""))?
        };
    } else {
        return Err(format!("unrecognised argument location \"{token}\""));
    }
    Ok(arg)
}

/// Read the target binary.
pub fn read_binary(path: &Path) -> Result<Vec<u8>, ProbeAttachError> {
    std::fs::read(path).map_err(|source| ProbeAttachError::Binary {
        path: path.to_path_buf(),
        source,
    })
}

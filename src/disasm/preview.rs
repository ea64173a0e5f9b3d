//! Disassembly of the first instructions at a payload's entry point

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
use serde::Serialize;

use crate::image::loader::ShellcodeImage;
use crate::platform::catalog::{ArchitectureDescriptor, CpuFamily};

/// One decoded instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewLine {
    /// Offset from the start of the image
    pub offset: u64,
    pub bytes: String,
    pub text: String,
}

/// x86/x86-64 entry-point decoder
pub struct EntryPreview {
    bitness: u32,
}

impl EntryPreview {
    /// A previewer for `arch`, or `None` for non-x86 targets
    pub fn for_arch(arch: &ArchitectureDescriptor) -> Option<Self> {
        (arch.family == CpuFamily::X86).then(|| Self {
            bitness: arch.bits.bits(),
        })
    }

    /// Decode up to `count` instructions starting at the image's entry offset.
    ///
    /// Decoding stops early at the end of the image or at the first invalid encoding,
    /// which is included as `(bad)`.
    pub fn decode(&self, image: &ShellcodeImage, count: usize) -> Vec<PreviewLine> {
        let code = image.entry_bytes();
        let mut decoder = Decoder::with_ip(
            self.bitness,
            code,
            image.entry_offset() as u64,
            DecoderOptions::NONE,
        );

        let mut formatter = NasmFormatter::new();
        formatter.options_mut().set_first_operand_char_index(8);

        let mut lines = Vec::with_capacity(count);
        let mut instr = Instruction::default();

        while decoder.can_decode() && lines.len() < count {
            decoder.decode_out(&mut instr);

            let start = (instr.ip() - image.entry_offset() as u64) as usize;
            let end = (start + instr.len()).min(code.len());
            let bytes = code[start..end]
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");

            let text = if instr.is_invalid() {
                "(bad)".to_string()
            } else {
                let mut out = String::new();
                formatter.format(&instr, &mut out);
                out
            };

            lines.push(PreviewLine {
                offset: instr.ip(),
                bytes,
                text,
            });

            if instr.is_invalid() {
                break;
            }
        }

        lines
    }
}

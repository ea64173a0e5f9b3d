//! Shared test utilities and fixtures for Shellhost tests

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::time::Duration;

use shellhost::engine::inject::{ProcessApi, RemoteRegion, WaitOutcome};
use shellhost::error::{LoaderError, Result};
use shellhost::platform::catalog::{elf_machine, pe_machine};

// ============================================================================
// Payload Bytes
// ============================================================================

/// RET instruction (0xC3)
pub const RET: &[u8] = &[0xC3];

/// NOP instruction (0x90)
pub const NOP: &[u8] = &[0x90];

/// mov eax, 42; ret
pub const X86_RETURN_42: &[u8] = &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];

/// mov w0, #42; ret
pub const A64_RETURN_42: &[u8] = &[0x40, 0x05, 0x80, 0x52, 0xC0, 0x03, 0x5F, 0xD6];

/// `count` NOPs followed by `tail`
pub fn nop_sled(count: usize, tail: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0x90; count];
    bytes.extend_from_slice(tail);
    bytes
}

// ============================================================================
// Synthetic ELF Containers
// ============================================================================

/// ELF header plus a single program header, for either class
pub fn elf_headers_len(class64: bool) -> usize {
    if class64 {
        64 + 56
    } else {
        52 + 32
    }
}

/// Create a minimal executable ELF with one `PF_R | PF_X` `PT_LOAD` segment.
///
/// The segment maps `code` (which starts right after the headers in the file) at
/// virtual address `base`, and the header declares `entry` as the entry point.
pub fn make_elf(class64: bool, machine: u16, base: u64, entry: u64, code: &[u8]) -> Vec<u8> {
    let code_offset = elf_headers_len(class64) as u64;
    let size = code.len() as u64;
    let mut elf = Vec::new();

    // e_ident
    elf.extend_from_slice(&[0x7F, b'E', b'L', b'F']);
    elf.push(if class64 { 2 } else { 1 }); // EI_CLASS
    elf.push(1); // little-endian
    elf.push(1); // EV_CURRENT
    elf.push(0); // System V ABI
    elf.extend_from_slice(&[0; 8]);

    elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf.extend_from_slice(&machine.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes()); // e_version

    if class64 {
        elf.extend_from_slice(&entry.to_le_bytes());
        elf.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    } else {
        elf.extend_from_slice(&(entry as u32).to_le_bytes());
        elf.extend_from_slice(&52u32.to_le_bytes());
        elf.extend_from_slice(&0u32.to_le_bytes());
    }

    let flags: u32 = if machine == elf_machine::EM_ARM { 0x0500_0000 } else { 0 };
    elf.extend_from_slice(&flags.to_le_bytes());

    let (ehsize, phentsize, shentsize): (u16, u16, u16) =
        if class64 { (64, 56, 64) } else { (52, 32, 40) };
    elf.extend_from_slice(&ehsize.to_le_bytes());
    elf.extend_from_slice(&phentsize.to_le_bytes());
    elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    elf.extend_from_slice(&shentsize.to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    // Program header: PT_LOAD, PF_R | PF_X
    if class64 {
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&5u32.to_le_bytes());
        elf.extend_from_slice(&code_offset.to_le_bytes());
        elf.extend_from_slice(&base.to_le_bytes());
        elf.extend_from_slice(&base.to_le_bytes());
        elf.extend_from_slice(&size.to_le_bytes());
        elf.extend_from_slice(&size.to_le_bytes());
        elf.extend_from_slice(&0x1000u64.to_le_bytes());
    } else {
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&(code_offset as u32).to_le_bytes());
        elf.extend_from_slice(&(base as u32).to_le_bytes());
        elf.extend_from_slice(&(base as u32).to_le_bytes());
        elf.extend_from_slice(&(size as u32).to_le_bytes());
        elf.extend_from_slice(&(size as u32).to_le_bytes());
        elf.extend_from_slice(&5u32.to_le_bytes());
        elf.extend_from_slice(&0x1000u32.to_le_bytes());
    }

    assert_eq!(elf.len() as u64, code_offset);
    elf.extend_from_slice(code);
    elf
}

/// x86-64 ELF64 loading `code` at 0x400000 with the entry `offset` bytes in
pub fn make_elf64(code: &[u8], offset: u64) -> Vec<u8> {
    make_elf(true, elf_machine::EM_X86_64, 0x400000, 0x400000 + offset, code)
}

/// i386 ELF32 loading `code` at 0x08048000 with the entry `offset` bytes in
pub fn make_elf32(code: &[u8], offset: u64) -> Vec<u8> {
    make_elf(false, elf_machine::EM_386, 0x0804_8000, 0x0804_8000 + offset, code)
}

// ============================================================================
// Synthetic PE Containers
// ============================================================================

/// Section characteristics: CNT_CODE | MEM_EXECUTE | MEM_READ
pub const SCN_CODE: u32 = 0x6000_0020;

/// Section characteristics: INITIALIZED_DATA | MEM_READ
pub const SCN_DATA: u32 = 0x4000_0040;

/// File alignment of the synthetic PE, also the size of every section's raw data
pub const PE_FILE_ALIGN: usize = 0x200;

/// One section of a synthetic PE
pub struct PeSection<'a> {
    pub name: &'a str,
    pub rva: u32,
    pub characteristics: u32,
    pub data: &'a [u8],
}

/// Create a minimal PE32+ image for `machine` with the given sections.
///
/// Every section's raw data occupies one `PE_FILE_ALIGN` block, padded with NOPs,
/// in declaration order after the headers.
pub fn make_pe(machine: u16, entry_rva: u32, sections: &[PeSection<'_>]) -> Vec<u8> {
    let mut pe = Vec::new();

    // DOS header: "MZ", e_lfanew at offset 60
    pe.extend_from_slice(b"MZ");
    pe.resize(60, 0);
    pe.extend_from_slice(&0x80u32.to_le_bytes());
    pe.resize(0x80, 0);

    pe.extend_from_slice(b"PE\0\0");

    // COFF file header
    pe.extend_from_slice(&machine.to_le_bytes());
    pe.extend_from_slice(&(sections.len() as u16).to_le_bytes());
    pe.extend_from_slice(&0u32.to_le_bytes()); // TimeDateStamp
    pe.extend_from_slice(&0u32.to_le_bytes()); // PointerToSymbolTable
    pe.extend_from_slice(&0u32.to_le_bytes()); // NumberOfSymbols
    pe.extend_from_slice(&240u16.to_le_bytes()); // SizeOfOptionalHeader
    pe.extend_from_slice(&0x22u16.to_le_bytes()); // EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE

    // Optional header (PE32+)
    let size_of_image = 0x1000 + 0x1000 * sections.len() as u32;
    pe.extend_from_slice(&0x20Bu16.to_le_bytes()); // Magic
    pe.extend_from_slice(&[0x0E, 0x00]); // LinkerVersion
    pe.extend_from_slice(&(PE_FILE_ALIGN as u32).to_le_bytes()); // SizeOfCode
    pe.extend_from_slice(&0u32.to_le_bytes()); // SizeOfInitializedData
    pe.extend_from_slice(&0u32.to_le_bytes()); // SizeOfUninitializedData
    pe.extend_from_slice(&entry_rva.to_le_bytes()); // AddressOfEntryPoint
    pe.extend_from_slice(&0x1000u32.to_le_bytes()); // BaseOfCode
    pe.extend_from_slice(&0x1_4000_0000u64.to_le_bytes()); // ImageBase
    pe.extend_from_slice(&0x1000u32.to_le_bytes()); // SectionAlignment
    pe.extend_from_slice(&(PE_FILE_ALIGN as u32).to_le_bytes()); // FileAlignment
    pe.extend_from_slice(&[6, 0, 0, 0, 0, 0, 0, 0, 6, 0, 0, 0]); // OS/image/subsystem versions
    pe.extend_from_slice(&0u32.to_le_bytes()); // Win32VersionValue
    pe.extend_from_slice(&size_of_image.to_le_bytes());
    pe.extend_from_slice(&(PE_FILE_ALIGN as u32).to_le_bytes()); // SizeOfHeaders
    pe.extend_from_slice(&0u32.to_le_bytes()); // CheckSum
    pe.extend_from_slice(&3u16.to_le_bytes()); // Subsystem: CONSOLE
    pe.extend_from_slice(&0x8160u16.to_le_bytes()); // DllCharacteristics
    pe.extend_from_slice(&0x10_0000u64.to_le_bytes()); // SizeOfStackReserve
    pe.extend_from_slice(&0x1000u64.to_le_bytes()); // SizeOfStackCommit
    pe.extend_from_slice(&0x10_0000u64.to_le_bytes()); // SizeOfHeapReserve
    pe.extend_from_slice(&0x1000u64.to_le_bytes()); // SizeOfHeapCommit
    pe.extend_from_slice(&0u32.to_le_bytes()); // LoaderFlags
    pe.extend_from_slice(&16u32.to_le_bytes()); // NumberOfRvaAndSizes
    pe.extend_from_slice(&[0u8; 16 * 8]); // data directories

    // Section table
    for (index, section) in sections.iter().enumerate() {
        let mut name = [0u8; 8];
        let len = section.name.len().min(8);
        name[..len].copy_from_slice(&section.name.as_bytes()[..len]);
        pe.extend_from_slice(&name);
        pe.extend_from_slice(&(PE_FILE_ALIGN as u32).to_le_bytes()); // VirtualSize
        pe.extend_from_slice(&section.rva.to_le_bytes());
        pe.extend_from_slice(&(PE_FILE_ALIGN as u32).to_le_bytes()); // SizeOfRawData
        pe.extend_from_slice(&((PE_FILE_ALIGN * (index + 1)) as u32).to_le_bytes());
        pe.extend_from_slice(&[0u8; 12]); // relocations, line numbers
        pe.extend_from_slice(&section.characteristics.to_le_bytes());
    }

    assert!(pe.len() <= PE_FILE_ALIGN, "headers overflow the first file block");
    pe.resize(PE_FILE_ALIGN, 0);

    for section in sections {
        let mut raw = section.data.to_vec();
        raw.resize(PE_FILE_ALIGN, 0x90);
        pe.extend_from_slice(&raw);
    }

    pe
}

/// x86-64 PE with `.text` at RVA 0x1000 holding `code`, entry `offset` bytes in
pub fn make_pe64(code: &[u8], offset: u32) -> Vec<u8> {
    make_pe(
        pe_machine::AMD64,
        0x1000 + offset,
        &[PeSection {
            name: ".text",
            rva: 0x1000,
            characteristics: SCN_CODE,
            data: code,
        }],
    )
}

// ============================================================================
// Recording ProcessApi Double
// ============================================================================

/// A step of the injection protocol the double can be told to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Spawn,
    Allocate,
    Write,
    Launch,
    Wait,
    ExitCode,
    CloseThread,
    Terminate,
    CloseProcess,
}

/// Observable side effect of a call on the double
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Spawn { host: PathBuf, machine: Option<u16> },
    Allocate { size: usize },
    Write { base: u64, len: usize },
    Launch { start: u64 },
    Wait,
    ExitCode,
    CloseThread,
    Terminate,
    CloseProcess,
}

#[derive(Debug)]
pub struct MockProcess {
    pub id: u32,
}

#[derive(Debug)]
pub struct MockThread {
    pub id: u32,
}

/// Process API double that records every call, can fail any step, and counts live
/// handles and regions.
pub struct MockProcessApi {
    pub events: RefCell<Vec<Event>>,
    failures: Vec<Step>,
    short_write: Option<usize>,
    pending_waits: Cell<usize>,
    never_finish: bool,
    exit_code: u32,
    next_id: Cell<u32>,
    pub open_processes: Cell<usize>,
    pub open_threads: Cell<usize>,
    pub allocations: Cell<usize>,
}

/// Base address of the first remote region handed out
pub const REMOTE_BASE: u64 = 0x7ff0_0000_0000;

impl MockProcessApi {
    pub fn new() -> Self {
        Self {
            events: RefCell::new(Vec::new()),
            failures: Vec::new(),
            short_write: None,
            pending_waits: Cell::new(0),
            never_finish: false,
            exit_code: 42,
            next_id: Cell::new(1),
            open_processes: Cell::new(0),
            open_threads: Cell::new(0),
            allocations: Cell::new(0),
        }
    }

    /// Fail `step` with the error a real backend would report
    pub fn failing_at(mut self, step: Step) -> Self {
        self.failures.push(step);
        self
    }

    /// Report only `written` bytes transferred
    pub fn with_short_write(mut self, written: usize) -> Self {
        self.short_write = Some(written);
        self
    }

    /// Report the thread as running for `count` waits before it finishes
    pub fn with_pending_waits(self, count: usize) -> Self {
        self.pending_waits.set(count);
        self
    }

    /// The remote thread never finishes
    pub fn hanging(mut self) -> Self {
        self.never_finish = true;
        self
    }

    pub fn with_exit_code(mut self, code: u32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Recorded events with consecutive waits collapsed into one
    pub fn protocol(&self) -> Vec<Event> {
        let mut events = self.events();
        events.dedup_by(|a, b| *a == Event::Wait && *b == Event::Wait);
        events
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events.borrow().iter().filter(|e| *e == event).count()
    }

    /// No process or thread handle is left open
    pub fn assert_released(&self) {
        assert_eq!(self.open_processes.get(), 0, "process handle leaked");
        assert_eq!(self.open_threads.get(), 0, "thread handle leaked");
    }

    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    fn fails(&self, step: Step) -> bool {
        self.failures.contains(&step)
    }

    fn next_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }
}

impl Default for MockProcessApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessApi for MockProcessApi {
    type Process = MockProcess;
    type Thread = MockThread;

    fn spawn_suspended(&self, host: &Path, machine: Option<u16>) -> Result<MockProcess> {
        self.record(Event::Spawn {
            host: host.to_path_buf(),
            machine,
        });
        if self.fails(Step::Spawn) {
            return Err(LoaderError::ProcessCreation("injected spawn failure".to_string()));
        }
        self.open_processes.set(self.open_processes.get() + 1);
        Ok(MockProcess { id: self.next_id() })
    }

    fn allocate(&self, _process: &MockProcess, size: usize) -> Result<RemoteRegion> {
        self.record(Event::Allocate { size });
        if self.fails(Step::Allocate) {
            return Err(LoaderError::Allocation("injected allocation failure".to_string()));
        }
        self.allocations.set(self.allocations.get() + 1);
        Ok(RemoteRegion {
            base: REMOTE_BASE,
            size,
        })
    }

    fn write(&self, _process: &MockProcess, region: &RemoteRegion, bytes: &[u8]) -> Result<usize> {
        self.record(Event::Write {
            base: region.base,
            len: bytes.len(),
        });
        if self.fails(Step::Write) {
            return Err(LoaderError::Execution("injected write failure".to_string()));
        }
        Ok(self.short_write.unwrap_or(bytes.len()))
    }

    fn create_thread(&self, _process: &MockProcess, start: u64) -> Result<MockThread> {
        self.record(Event::Launch { start });
        if self.fails(Step::Launch) {
            return Err(LoaderError::Execution("injected thread failure".to_string()));
        }
        self.open_threads.set(self.open_threads.get() + 1);
        Ok(MockThread { id: self.next_id() })
    }

    fn wait(&self, _thread: &MockThread, slice: Duration) -> Result<WaitOutcome> {
        self.record(Event::Wait);
        if self.fails(Step::Wait) {
            return Err(LoaderError::Execution("injected wait failure".to_string()));
        }
        if self.never_finish {
            std::thread::sleep(slice.min(Duration::from_millis(5)));
            return Ok(WaitOutcome::Pending);
        }
        let pending = self.pending_waits.get();
        if pending > 0 {
            self.pending_waits.set(pending - 1);
            return Ok(WaitOutcome::Pending);
        }
        Ok(WaitOutcome::Completed)
    }

    fn exit_code(&self, _thread: &MockThread) -> Result<u32> {
        self.record(Event::ExitCode);
        if self.fails(Step::ExitCode) {
            return Err(LoaderError::Execution("injected exit code failure".to_string()));
        }
        Ok(self.exit_code)
    }

    fn close_thread(&self, _thread: MockThread) -> Result<()> {
        self.record(Event::CloseThread);
        self.open_threads.set(self.open_threads.get() - 1);
        if self.fails(Step::CloseThread) {
            return Err(LoaderError::Execution("injected close failure".to_string()));
        }
        Ok(())
    }

    fn terminate(&self, _process: &MockProcess) -> Result<()> {
        self.record(Event::Terminate);
        if self.fails(Step::Terminate) {
            return Err(LoaderError::Execution("injected terminate failure".to_string()));
        }
        Ok(())
    }

    fn close_process(&self, _process: MockProcess) -> Result<()> {
        self.record(Event::CloseProcess);
        self.open_processes.set(self.open_processes.get() - 1);
        if self.fails(Step::CloseProcess) {
            return Err(LoaderError::Execution("injected close failure".to_string()));
        }
        Ok(())
    }
}

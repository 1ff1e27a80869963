use std::io::{self, Cursor};

use nyulan::bytecode::{Builtin, CodeBuilder, Opcode};
use nyulan::debuginfo::{DebugInfo, ADDR2LINE_SECTION, SOURCEFILES_SECTION};
use nyulan::events::{EventLog, ExecutionEvent};
use nyulan::objectfile::{Endian, ObjectFile};
use nyulan::types::{Address, AddressSpace, OneStep, Register};
use nyulan::vm::{HostStreams, Limits, SharedBuffer, Termination, VMError, VirtualMachine};

const SCRATCH: u8 = 15;

fn object(literal_data: &[u8], code: Vec<OneStep>) -> ObjectFile {
    let mut object = ObjectFile::new().with_label("_start", 0);
    object.literal_data = literal_data.to_vec();
    object.code = code;
    object
}

/// Serializes and parses again, so every program also exercises the codec.
fn reload(object: &ObjectFile) -> ObjectFile {
    ObjectFile::from_bytes(&object.to_bytes().unwrap()).unwrap()
}

fn vm_for(object: &ObjectFile, stdin: &[u8]) -> (VirtualMachine, SharedBuffer) {
    let out = SharedBuffer::new();
    let vm = VirtualMachine::new(&object.literal_data).with_streams(HostStreams::new(
        Box::new(Cursor::new(stdin.to_vec())),
        Box::new(out.clone()),
        Box::new(io::sink()),
    ));
    (vm, out)
}

#[test]
fn test_hello_in_both_byte_orders() {
    for endian in [Endian::Little, Endian::Big] {
        let mut code = CodeBuilder::new();
        code.push_literal(b'h')
            .push_literal(b'i')
            .push_u64(2)
            .push_u64(Address::static_data(0).value())
            .push_u64(1)
            .call_builtin(SCRATCH, Builtin::Write);
        let mut program = object(b"hi\0", code.finish());
        program.endian = endian;
        let program = reload(&program);

        let (mut vm, out) = vm_for(&program, b"");
        let entry = program.entry_point().unwrap();
        assert_eq!(
            vm.execute(&program.code, entry),
            Ok(Termination::EndOfCode)
        );
        assert_eq!(out.contents(), b"hi");
    }
}

#[test]
fn test_loop_and_subroutine() {
    // r2 = 1 + 2 + ... + 10, then doubled by a subroutine.
    let mut code = CodeBuilder::new();
    code.load_immediate(1, 10);
    code.load_immediate(2, 0);
    code.load_immediate(3, 1);
    let loop_target = code.load_immediate(4, 0);
    let end_target = code.load_immediate(5, 0);
    let func_target = code.load_immediate(6, 0);
    let exit_target = code.load_immediate(7, 0);

    let loop_start = code.position();
    code.emit(Opcode::IfZ, 1, 5)
        .emit(Opcode::Add, 2, 1)
        .emit(Opcode::Sub, 1, 3)
        .emit(Opcode::Goto, 4, 0);
    let end = code.position();
    code.emit(Opcode::Call, 6, 0).emit(Opcode::Goto, 7, 0);
    let func = code.position();
    code.emit(Opcode::Add, 2, 2).emit(Opcode::Ret, 0, 0);
    let exit = code.position();

    code.patch_immediate(loop_target, loop_start);
    code.patch_immediate(end_target, end);
    code.patch_immediate(func_target, func);
    code.patch_immediate(exit_target, exit);

    let program = reload(&object(&[], code.finish()));
    let (mut vm, _) = vm_for(&program, b"");
    assert_eq!(
        vm.execute(&program.code, Address(0)),
        Ok(Termination::EndOfCode)
    );
    assert_eq!(vm.register(2), Register(110));
    assert_eq!(vm.call_stack_depth(), 0);
    assert_eq!(vm.calculation_stack_depth(), 0);
}

#[test]
fn test_echo_line_from_stdin() {
    let mut code = CodeBuilder::new();
    code.push_u64(64)
        .push_u64(0x100)
        .push_u64(0)
        .call_builtin(SCRATCH, Builtin::Read)
        // The count left by READ becomes WRITE's length.
        .push_u64(0x100)
        .push_u64(1)
        .call_builtin(SCRATCH, Builtin::Write);
    let program = object(&[], code.finish());

    let (mut vm, out) = vm_for(&program, b"first line\nsecond line\n");
    vm.execute(&program.code, Address(0)).unwrap();
    assert_eq!(out.contents(), b"first line\n");
}

#[test]
fn test_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    let mut literal = path.to_string_lossy().into_owned().into_bytes();
    literal.push(0);
    let text_offset = literal.len() as u64;
    literal.extend_from_slice(b"line one\nline two\n");

    let mut code = CodeBuilder::new();
    // fd = OPEN(path); WRITE(fd, text, 18); CLOSE(fd)
    code.push_u64(Address::static_data(0).value())
        .call_builtin(SCRATCH, Builtin::Open)
        .emit(Opcode::Pop64, 8, 0)
        .push_u64(18)
        .push_u64(Address::static_data(text_offset).value())
        .emit(Opcode::PushR64, 8, 0)
        .call_builtin(SCRATCH, Builtin::Write)
        .emit(Opcode::PushR64, 8, 0)
        .call_builtin(SCRATCH, Builtin::Close);
    // fd = OPEN(path); r9 = READ(fd, 0x200, 64); CLOSE(fd)
    code.push_u64(Address::static_data(0).value())
        .call_builtin(SCRATCH, Builtin::Open)
        .emit(Opcode::Pop64, 8, 0)
        .push_u64(64)
        .push_u64(0x200)
        .emit(Opcode::PushR64, 8, 0)
        .call_builtin(SCRATCH, Builtin::Read)
        .emit(Opcode::Pop64, 9, 0)
        .emit(Opcode::PushR64, 8, 0)
        .call_builtin(SCRATCH, Builtin::Close);
    let program = reload(&object(&literal, code.finish()));

    let (mut vm, _) = vm_for(&program, b"");
    vm.execute(&program.code, Address(0)).unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"line one\nline two\n");
    assert_eq!(vm.register(8), Register(4));
    assert_eq!(vm.register(9), Register(9));
    assert_eq!(
        vm.memory().read_bytes(Address(0x200), 9).unwrap(),
        b"line one\n"
    );
}

#[test]
fn test_heap_bytes_vanish_after_free() {
    let mut code = CodeBuilder::new();
    code.push_u64(16)
        .call_builtin(SCRATCH, Builtin::Malloc)
        .emit(Opcode::Pop64, 1, 0);
    code.load_immediate(2, 0xABCD);
    code.emit(Opcode::Store64, 1, 2)
        .emit(Opcode::Load64, 3, 1)
        .push_u64(16)
        .emit(Opcode::PushR64, 1, 0)
        .call_builtin(SCRATCH, Builtin::Free)
        .emit(Opcode::Load8, 4, 1);
    let program = object(&[], code.finish());

    let limits = Limits {
        heap_base: 0x4000,
        ..Limits::default()
    };
    let (vm, _) = vm_for(&program, b"");
    let mut vm = vm.with_limits(limits);
    assert_eq!(
        vm.execute(&program.code, Address(0)),
        Err(VMError::MemoryAccess {
            space: AddressSpace::Dynamic,
            offset: 0x4000
        })
    );
    assert_eq!(vm.register(1), Register(0x4000));
    assert_eq!(vm.register(3), Register(0xABCD));
}

#[test]
fn test_oversized_malloc_faults_immediately() {
    let mut code = CodeBuilder::new();
    code.push_u64(u64::MAX)
        .call_builtin(SCRATCH, Builtin::Malloc);
    let program = object(&[], code.finish());

    let (vm, _) = vm_for(&program, b"");
    let mut vm = vm.with_limits(Limits {
        max_heap_bytes: 1 << 20,
        ..Limits::default()
    });
    assert_eq!(
        vm.execute(&program.code, Address(0)),
        Err(VMError::HeapExhausted {
            requested: u64::MAX,
            limit: 1 << 20
        })
    );
}

#[test]
fn test_load_at_end_of_dynamic_space_faults() {
    let last = (1u64 << 63) - 1;
    let mut code = CodeBuilder::new();
    code.load_immediate(1, last);
    code.emit(Opcode::Store8, 1, 1).emit(Opcode::Load16, 2, 1);
    let program = object(b"zz", code.finish());

    let (mut vm, _) = vm_for(&program, b"");
    assert_eq!(
        vm.execute(&program.code, Address(0)),
        Err(VMError::CrossesAddressSpace {
            space: AddressSpace::Dynamic,
            offset: last,
            len: 2
        })
    );
}

#[test]
fn test_exit_status() {
    let mut code = CodeBuilder::new();
    code.push_u64(42).call_builtin(SCRATCH, Builtin::Exit);
    code.push_literal(1);
    let program = object(&[], code.finish());

    let (mut vm, _) = vm_for(&program, b"");
    let termination = vm.execute(&program.code, Address(0)).unwrap();
    assert_eq!(termination, Termination::Exit(42));
    assert_eq!(termination.status(), 42);
    assert_eq!(vm.calculation_stack_depth(), 0);
}

#[test]
fn test_events_follow_execution() {
    let code = vec![
        OneStep::encode(Opcode::Nop, 0, 0),
        OneStep::encode(Opcode::Goto, 1, 0),
        OneStep::encode(Opcode::Nop, 0, 0),
    ];
    let program = object(&[], code);
    let (mut vm, _) = vm_for(&program, b"");
    vm.set_register(1, Register(3));
    let log = EventLog::with_jumps();
    vm.install_observer(Box::new(log.clone()));
    vm.execute(&program.code, Address(0)).unwrap();

    let jumps: Vec<u64> = log
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ExecutionEvent::Jump { address } => Some(address),
            _ => None,
        })
        .collect();
    assert_eq!(jumps, vec![1, 3]);
    assert_eq!(log.len(), 4);
}

#[test]
fn test_debug_info_maps_code_to_lines() {
    let code = vec![
        OneStep::encode(Opcode::Nop, 0, 0),
        OneStep::encode(Opcode::Nop, 0, 0),
    ];
    let mut program = object(&[], code);
    program.endian = Endian::Big;
    let program = program
        .with_section(ADDR2LINE_SECTION, vec![8, 16, 0, 0x00, 0x0A, 1, 0x01, 0x02])
        .with_section(SOURCEFILES_SECTION, b"main.nyu\0util.nyu\0".to_vec());
    let program = reload(&program);

    let info = DebugInfo::load(&program).unwrap();
    assert_eq!(info.locate(Address(0)).unwrap(), ("main.nyu", 10));
    assert_eq!(info.locate(Address(1)).unwrap(), ("util.nyu", 0x0102));
}

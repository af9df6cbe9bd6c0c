use crate::bytecode::chunk::Chunk;
use crate::bytecode::op::OpCode;
use crate::lang::object::{Heap, Obj, ObjRef};
use crate::lang::value::Value;

/// Print the disassembly of a compiled function, then recurse into every
/// function constant in its pool so nested closures get dumped too.
pub fn print_function(heap: &Heap, function: ObjRef) {
    let func = heap.function(function);
    let label = match func.name {
        Some(name) => heap.str_chars(name).to_string(),
        None => "script".to_string(),
    };

    println!("════════════════════════════════════════");
    println!(" {}", label);
    println!(" {} bytes, {} constants", func.chunk.code.len(), func.chunk.constants.len());
    println!("════════════════════════════════════════");
    disassemble_chunk(heap, &func.chunk);
    println!();

    for constant in &func.chunk.constants {
        if let Value::Obj(r) = constant {
            if matches!(heap.get(*r), Obj::Function(_)) {
                print_function(heap, *r);
            }
        }
    }
}

/// Disassemble a whole chunk, marking jump targets.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk) {
    let targets = collect_jump_targets(heap, chunk);

    let mut offset = 0;
    while offset < chunk.code.len() {
        if targets.contains(&offset) {
            println!("      ┌──────────────────────────────────");
        }
        let marker = if targets.contains(&offset) { "► " } else { "  " };
        print!("{:04} {}", offset, marker);

        if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
            print!("   | ");
        } else {
            print!("{:4} ", chunk.line_at(offset));
        }

        offset = print_instruction(heap, chunk, offset);
    }
}

/// Decode one instruction, print it, and return the next offset.
fn print_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(unknown) => {
            println!("?? unknown opcode {}", unknown);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant | OpCode::GetGlobal | OpCode::DefineGlobal | OpCode::SetGlobal => {
            let index = chunk.code[offset + 1];
            let constant = chunk.constants[index as usize];
            println!("{:<14} {:3} '{}'", op.name(), index, constant.show(heap));
            offset + 2
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let operand = chunk.code[offset + 1];
            println!("{:<14} {:3}", op.name(), operand);
            offset + 2
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let jump = read_u16(chunk, offset + 1);
            let (target, direction) = if op == OpCode::Loop {
                (offset + 3 - jump, "↑")
            } else {
                (offset + 3 + jump, "↓")
            };
            println!("{:<14} {:3} {} (→ {:04})", op.name(), jump, direction, target);
            offset + 3
        }
        OpCode::Closure => {
            let index = chunk.code[offset + 1];
            let constant = chunk.constants[index as usize];
            println!("{:<14} {:3} {}", op.name(), index, constant.show(heap));

            let upvalue_count = match constant {
                Value::Obj(r) => heap.function(r).upvalue_count,
                _ => 0,
            };
            let mut at = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = chunk.code[at] == 1;
                let slot = chunk.code[at + 1];
                println!(
                    "{:04}   |      {} {}",
                    at,
                    if is_local { "local" } else { "upvalue" },
                    slot
                );
                at += 2;
            }
            at
        }
        _ => {
            println!("{}", op.name());
            offset + 1
        }
    }
}

/// Walk the instruction stream once to find every jump destination.
fn collect_jump_targets(heap: &Heap, chunk: &Chunk) -> Vec<usize> {
    let mut targets = Vec::new();

    let mut offset = 0;
    while offset < chunk.code.len() {
        let Ok(op) = OpCode::try_from(chunk.code[offset]) else {
            offset += 1;
            continue;
        };
        match op {
            OpCode::Jump | OpCode::JumpIfFalse => {
                let target = offset + 3 + read_u16(chunk, offset + 1);
                if !targets.contains(&target) {
                    targets.push(target);
                }
                offset += 3;
            }
            OpCode::Loop => {
                let target = offset + 3 - read_u16(chunk, offset + 1);
                if !targets.contains(&target) {
                    targets.push(target);
                }
                offset += 3;
            }
            OpCode::Closure => {
                let index = chunk.code[offset + 1];
                let upvalue_count = match chunk.constants[index as usize] {
                    Value::Obj(r) => heap.function(r).upvalue_count,
                    _ => 0,
                };
                offset += 2 + 2 * upvalue_count;
            }
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call => offset += 2,
            _ => offset += 1,
        }
    }

    targets
}

fn read_u16(chunk: &Chunk, offset: usize) -> usize {
    ((chunk.code[offset] as usize) << 8) | chunk.code[offset + 1] as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile;

    #[test]
    fn test_jump_targets_for_if() {
        let mut heap = Heap::new();
        let f = compile("if (true) print 1; else print 2;", &mut heap).expect("compiles");
        let chunk = &heap.function(f).chunk;

        let targets = collect_jump_targets(&heap, chunk);
        assert_eq!(targets.len(), 2);
        for target in targets {
            assert!(target <= chunk.code.len());
        }
    }

    #[test]
    fn test_jump_targets_for_while_point_backward() {
        let mut heap = Heap::new();
        let f = compile("while (false) print 1;", &mut heap).expect("compiles");
        let chunk = &heap.function(f).chunk;

        let targets = collect_jump_targets(&heap, chunk);
        // The loop's backward target is the condition at offset 0.
        assert!(targets.contains(&0));
    }

    #[test]
    fn test_closure_operands_are_skipped_not_decoded() {
        let mut heap = Heap::new();
        let f = compile(
            "fun outer() { var x = 1; fun inner() { print x; } }",
            &mut heap,
        )
        .expect("compiles");

        // Walking the outer function must not misread the (is_local, index)
        // pair after CLOSURE as opcodes.
        let outer = heap
            .function(f)
            .chunk
            .constants
            .iter()
            .find_map(|c| c.as_obj())
            .map(|r| heap.function(r))
            .expect("outer function constant");
        let targets = collect_jump_targets(&heap, &outer.chunk);
        assert!(targets.is_empty());
    }
}

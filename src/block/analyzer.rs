//! Block splitting.

use std::collections::HashSet;

use kedr_asm::{DecodedInsn, Mnemonic, Operand};

use crate::block::BlockDescriptor;
use crate::consts::{MAX_BLOCK_VALUE_SLOTS, SLOTS_PLAIN_MEM_OP, SLOTS_STRING_OP_XY_DOUBLE, SLOTS_STRING_OP_XY_SINGLE};
use crate::ir::{BlockType, IrNode, JumpTable, JumpTableSlot, NodeId};

/// `true` for instructions that form a block entirely by themselves: the
/// instruction is both the start of one block and forces the next
/// instruction to start a new one.
fn forms_solo_block(node: &IrNode) -> Option<BlockType> {
    let insn = &node.insn;
    if insn.is_exit() || matches!(insn.mnemonic, Mnemonic::CallFar | Mnemonic::JmpFar) {
        return Some(BlockType::ControlOutOther);
    }
    if insn.mnemonic == Mnemonic::JmpIndirect {
        return Some(if node.inner_jmp_indirect {
            BlockType::JumpIndirectInner
        } else {
            BlockType::JumpIndirectOut
        });
    }
    if insn.mnemonic == Mnemonic::CallIndirect {
        return Some(BlockType::CallIndirect);
    }
    if is_outward_direct_transfer(node, insn.mnemonic) {
        return Some(match insn.mnemonic {
            Mnemonic::CallRel => BlockType::CallRel32Out,
            _ => BlockType::JumpRel32Out,
        });
    }
    if is_backward_direct_jump(node, insn.mnemonic) {
        return Some(BlockType::JumpBackwards);
    }
    if insn.is_locked {
        return Some(BlockType::LockedUpdate);
    }
    if insn.is_io_mem_op() {
        return Some(BlockType::IoMemOp);
    }
    if insn.is_barrier() {
        return Some(BlockType::BarrierOther);
    }
    None
}

fn is_outward_direct_transfer(node: &IrNode, mnemonic: Mnemonic) -> bool {
    matches!(mnemonic, Mnemonic::CallRel | Mnemonic::JmpRel | Mnemonic::JccRel) && node.iprel_addr != 0
}

fn is_backward_direct_jump(node: &IrNode, mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::JmpRel | Mnemonic::JccRel | Mnemonic::Jcxz | Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne
    ) && node.dest_addr != 0
        && node.dest_addr < node.orig_addr
        && node.dest_inner.is_some()
}

fn value_slots(node: &IrNode) -> usize {
    if !node.is_tracked_mem_op {
        0
    } else if node.is_string_op_xy {
        SLOTS_STRING_OP_XY_DOUBLE
    } else if node.is_string_op {
        SLOTS_STRING_OP_XY_SINGLE
    } else {
        SLOTS_PLAIN_MEM_OP
    }
}

/// Split `nodes` into blocks, tag each block-starting node, and allocate a
/// [`BlockDescriptor`] for every block that will emit memory events
/// (`Common`, `LockedUpdate`, `IoMemOp`). Returns the descriptors in block
/// order; each block-starting node's `block_desc_idx` indexes into it.
pub fn analyze_blocks(nodes: &mut [IrNode], jump_tables: &[JumpTable]) -> Vec<BlockDescriptor> {
    let jump_table_destinations: HashSet<NodeId> = jump_tables
        .iter()
        .flat_map(|t| t.slots.iter())
        .filter_map(|slot| match slot {
            JumpTableSlot::Node(id) => Some(*id),
            _ => None,
        })
        .collect();

    let mut forced_start: HashSet<NodeId> = HashSet::new();
    forced_start.insert(0);
    forced_start.extend(jump_table_destinations.iter().copied());

    let mut solo_type: Vec<Option<BlockType>> = vec![None; nodes.len()];
    for (id, node) in nodes.iter().enumerate() {
        if let Some(block_type) = forms_solo_block(node) {
            solo_type[id] = Some(block_type);
            forced_start.insert(id);
            if id + 1 < nodes.len() {
                forced_start.insert(id + 1);
            }
        }
    }

    let mut descriptors = Vec::new();
    let mut i = 0usize;
    while i < nodes.len() {
        let start = i;
        let block_type = solo_type[start].unwrap_or(BlockType::Common);

        let mut end = start;
        let mut slots_used = 0usize;
        let mut has_mem_op = false;

        if solo_type[start].is_some() {
            // Solo blocks are exactly one node.
        } else {
            loop {
                let needed = value_slots(&nodes[end]);
                if needed > 0 {
                    if slots_used + needed > MAX_BLOCK_VALUE_SLOTS {
                        break;
                    }
                    slots_used += needed;
                    has_mem_op = true;
                }
                let next = end + 1;
                if next >= nodes.len() || forced_start.contains(&next) {
                    break;
                }
                end = next;
            }
        }

        let resolved_type = if block_type == BlockType::Common && !has_mem_op {
            BlockType::CommonNoMemOps
        } else {
            block_type
        };

        nodes[start].block_start = true;
        nodes[start].block_type = Some(resolved_type);
        nodes[start].end_node = Some(end);

        if resolved_type.allocates_descriptor() {
            let max_events = count_events(&nodes[start..=end]);
            let mut descriptor = BlockDescriptor::new(max_events);
            for node in &nodes[start..=end] {
                if node.is_tracked_mem_op {
                    let is_write = writes_memory(&node.insn);
                    descriptor.push_event(node.orig_addr, node.insn.mem_operand_size, is_write, node.is_string_op);
                }
            }
            let idx = descriptors.len();
            descriptors.push(descriptor);
            nodes[start].block_desc_idx = Some(idx);
        }

        mark_jump_past_last(&mut nodes[start..=end], resolved_type);

        i = end + 1;
    }

    descriptors
}

fn count_events(block: &[IrNode]) -> usize {
    block.iter().filter(|n| n.is_tracked_mem_op).count()
}

/// Whether the memory operand is written, derived from operand position
/// rather than mnemonic: every tracked form's `operands[0]` is its
/// destination, so memory is written exactly when the destination slot is
/// `Eb`/`Ev`/`Ez`/`M` (the ModRM.rm-addressed operand) rather than `Gb`/`Gv`
/// (ModRM.reg). `MOV r, (mem)` (`8B /r`, `Gv, Ev`) is a read; `MOV (mem), r`
/// (`89 /r`, `Ev, Gv`) is a write; same split for the `Alu`/`Test`/`Xchg`
/// two-operand forms. Single-operand read-modify-write forms (`Not`/`Neg`/
/// `Inc`/`Dec`) always have the memory operand in slot 0, so they're always
/// writes.
fn writes_memory(insn: &DecodedInsn) -> bool {
    insn.operands
        .iter()
        .position(|op| matches!(op, Operand::Eb | Operand::Ev | Operand::Ez | Operand::M))
        == Some(0)
}

/// For `Common` blocks with trackable memory accesses, mark every forward
/// jump inside the block whose destination lies past the block's last
/// reference node.
fn mark_jump_past_last(block: &mut [IrNode], block_type: BlockType) {
    if block_type != BlockType::Common {
        return;
    }
    let last_addr = block.last().map(|n| n.orig_addr).unwrap_or(0);
    let mut any = false;
    for node in block.iter_mut() {
        if node.dest_addr > last_addr && node.dest_addr != 0 {
            node.jump_past_last = true;
            any = true;
        }
    }
    if any {
        if let Some(head) = block.first_mut() {
            head.block_has_jumps_out = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kedr_asm::{Bitness, Decoder};

    fn decode_nodes(bytes: &[u8], base: u64, bitness: Bitness) -> Vec<IrNode> {
        let decoder = Decoder::new(bitness);
        let mut nodes = Vec::new();
        let mut pc = base;
        let mut offset = 0usize;
        while offset < bytes.len() {
            let insn = decoder.decode(&bytes[offset..], pc).unwrap();
            let id = nodes.len();
            nodes.push(IrNode::reference(insn, pc, id));
            offset += insn.len as usize;
            pc += insn.len as u64;
        }
        nodes
    }

    #[test]
    fn straight_line_read_gets_one_common_block() {
        let mut nodes = decode_nodes(&[0x48, 0x8B, 0x07, 0xC3], 0x1000, Bitness::X64);
        let descriptors = analyze_blocks(&mut nodes, &[]);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].max_events, 1);
        assert_eq!(descriptors[0].read_mask, 1);
        assert!(nodes[0].block_start);
        assert_eq!(nodes[0].block_type, Some(BlockType::Common));
    }

    #[test]
    fn straight_line_write_gets_one_common_block() {
        // mov %rax,(%rdi); ret -- same ModRM byte as the read test above,
        // opcode 0x89 (Ev,Gv) instead of 0x8B (Gv,Ev), so memory is the
        // destination this time.
        let mut nodes = decode_nodes(&[0x48, 0x89, 0x07, 0xC3], 0x1000, Bitness::X64);
        let descriptors = analyze_blocks(&mut nodes, &[]);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].max_events, 1);
        assert_eq!(descriptors[0].write_mask, 1);
        assert_eq!(descriptors[0].read_mask, 0);
    }

    #[test]
    fn locked_update_is_a_solo_block() {
        // lock incl (%rdi); ret
        let mut nodes = decode_nodes(&[0xF0, 0xFF, 0x07, 0xC3], 0x1000, Bitness::X64);
        let descriptors = analyze_blocks(&mut nodes, &[]);
        assert_eq!(nodes[0].block_type, Some(BlockType::LockedUpdate));
        assert_eq!(nodes[0].end_node, Some(0));
        assert_eq!(descriptors.len(), 1);
    }
}

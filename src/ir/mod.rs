//! IR construction and the arena-based node representation.

mod builder;
mod jumptable;
mod node;
mod reloc;

pub use builder::build_function_ir;
pub use jumptable::{JumpTable, JumpTableSlot};
pub use node::{BarrierKind, BlockType, IrNode, NodeId};
pub use reloc::{Relocation, RelocationKind};

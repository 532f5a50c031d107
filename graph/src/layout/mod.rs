pub mod columns;
pub mod topo;

pub use columns::ColumnLayoutEngine;
pub use topo::TopoSorter;

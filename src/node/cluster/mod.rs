pub mod topology;

pub use topology::TopologyTable;

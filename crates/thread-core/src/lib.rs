pub mod dag;
pub mod thread_contracts;

pub use thread_contracts::{
    ContractError, DagEdge, DagStructure, Edge, EdgeType, Item, ItemPatch, ItemRole, Metadata,
    NewEdge, NewItem, NewStream, NewThread, SortOrder, Stream, StreamPatch, StreamSnapshot,
    StreamStatus, Thread, ThreadPatch, ThreadWithItems, Validate, Visibility,
};

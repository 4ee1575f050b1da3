pub mod asyncevent;
pub mod errorfmt;
pub mod numcell;
pub mod queue;

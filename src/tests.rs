mod basic;
mod compaction;
mod recovery;
mod tiering;
mod write_stall;

pub mod collision;
pub mod spatial;
pub mod store;
pub mod streamer;
pub mod world;

//! Wire protocols besides HTTP

pub mod memcached;

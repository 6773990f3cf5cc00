// Each integration binary compiles this module; not every binary uses every
// helper.
#![allow(dead_code)]

pub mod harness;

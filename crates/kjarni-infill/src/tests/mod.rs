mod common;
mod decoding;

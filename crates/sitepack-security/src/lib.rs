mod checksum;

pub use checksum::{
    sha256_file, sha256_hex, sha256_reader, verify_sha256, verify_sha256_file,
    verify_sha256_reader,
};

pub mod mdoc;
pub mod mrc;
pub mod rawtlt;

pub use mdoc::{parse_mdoc, read_mdoc, Acquisition, MdocDocument};
pub use mrc::{read_header, read_mrc, write_mrc, MrcHeader, MrcVolume, PixelMode};
pub use rawtlt::{read_rawtlt, write_rawtlt};

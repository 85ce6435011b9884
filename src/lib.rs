//! Codec for the RPA archive family used by the Ren'Py runtime.
//!
//! ```no_run
//! use renpak::reader::RpaReader;
//! use renpak::writer::{write_archive, PackOptions, PendingFile};
//!
//! // Write
//! let files = vec![PendingFile::new("greeting.txt", b"hello".to_vec())];
//! write_archive("out.rpa".as_ref(), &files, &PackOptions::default())?;
//!
//! // Read
//! let mut ar = RpaReader::open("out.rpa")?;
//! assert_eq!(ar.read_member("greeting.txt")?, b"hello");
//! # Ok::<(), renpak::ArchiveError>(())
//! ```

pub mod classify;
pub mod codec;
pub mod error;
pub mod header;
pub mod index;
pub mod io;
pub mod pickle;
pub mod reader;
pub mod writer;

pub use classify::{classify_script, Confidence, ScriptFormat, ScriptReport};
pub use error::{ArchiveError, DecompileError, Result};
pub use header::{Header, Version};
pub use index::{Index, IndexEntry};
pub use reader::{DecompileFn, ExtractReport, Progress, RpaReader, Stage};
pub use writer::{pack_dir, write_archive, PackOptions, PackSummary, PendingFile};

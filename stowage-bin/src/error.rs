use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot open archive `{}`", .path.display())]
    OpenArchive {
        path: PathBuf,
        #[source]
        source: stowage::Error,
    },

    #[error("cannot create archive `{}`", .path.display())]
    CreateArchive {
        path: PathBuf,
        #[source]
        source: stowage::Error,
    },

    #[error("cannot read archive `{}`", .path.display())]
    ReadArchive {
        path: PathBuf,
        #[source]
        source: stowage::Error,
    },

    #[error("cannot add `{}` to archive", .path.display())]
    AddFile {
        path: PathBuf,
        #[source]
        source: stowage::Error,
    },

    #[error("cannot process `{}`", .path.display())]
    ProcessFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot finish archive `{}`", .path.display())]
    FinishArchive {
        path: PathBuf,
        #[source]
        source: stowage::Error,
    },

    #[error("cannot extract archive")]
    Extract {
        #[source]
        source: stowage::ExtractError,
    },

    #[error("refusing to archive the output archive into itself")]
    SelfArchive,
}

/// Errors returned synchronously by [`Downloader::download_file`].
///
/// Network failures arriving after a download has started are not part of
/// this taxonomy; they reach the delegate as a failed notification instead.
///
/// [`Downloader::download_file`]: crate::core::downloader::Downloader::download_file
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid URL address: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported URL address: cannot open {0} URLs")]
    UnsupportedUrl(String),

    #[error("download already in progress")]
    AlreadyInProgress,
}

//! Streamed upload of data into a new volume.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument, warn};

use crate::client::HypervisorClient;
use crate::error::{BackendError, TransferError};
use crate::traits::UploadStream;

/// Size of the chunks read from the source and sent to the stream.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Create a volume of `length` bytes named `name` in `pool`, tagged with
/// `format`, and fill it with the content of `reader`.
///
/// The volume is never removed here: when the returned error says
/// [`volume_created`](TransferError::volume_created), cleaning it up is the
/// caller's business.
#[instrument(skip(client, reader))]
pub async fn upload<R>(
    client: &HypervisorClient,
    pool: &str,
    name: &str,
    format: &str,
    mut reader: R,
    length: u64,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
{
    client
        .create_volume(pool, name, length, format)
        .await
        .map_err(TransferError::Create)?;

    let mut stream = client
        .open_upload(pool, name, length)
        .await
        .map_err(TransferError::Open)?;

    let sent = pump(&mut reader, stream.as_mut()).await?;
    debug!(sent, "Source exhausted");

    match stream.finish().await {
        Ok(()) => {}
        Err(BackendError::Unsupported(reason)) => {
            debug!(%reason, "Stream finish not supported, transfer considered complete");
        }
        Err(e) => return Err(TransferError::Finish(e)),
    }

    info!(sent, "Upload complete");
    Ok(())
}

/// Copy the reader into the stream until end of input.
async fn pump<R>(reader: &mut R, stream: &mut dyn UploadStream) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(read) => {
                return Err(match stream.abort().await {
                    Ok(()) => TransferError::Read(read),
                    Err(abort) => TransferError::ReadAndAbort { read, abort },
                });
            }
        };

        let mut offset = 0;
        while offset < n {
            match stream.send(&buf[offset..n]).await {
                Ok(0) => {
                    abort_quietly(stream).await;
                    return Err(TransferError::Send(BackendError::Failed(
                        "stream accepted no data".to_string(),
                    )));
                }
                Ok(sent) => offset += sent,
                Err(e) => {
                    abort_quietly(stream).await;
                    return Err(TransferError::Send(e));
                }
            }
        }
        total += n as u64;
    }
}

async fn abort_quietly(stream: &mut dyn UploadStream) {
    if let Err(e) = stream.abort().await {
        warn!(error = %e, "Failed to abort upload stream");
    }
}

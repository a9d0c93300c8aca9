//! The TCP session surface: one task per connection, newline-delimited
//! frames, long-running operations (`newTx`, `watch`) included.

use futures::{SinkExt, StreamExt};
use logd_path::KindedPath;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::frame::{error_frame, parse_request, watch_frame, Request, RequestError};
use crate::server::codec::FrameCodec;
use crate::server::{handle_request, ServerContext};

/// Accepts connections until the listener task is dropped.
pub async fn serve(context: ServerContext, listener: TcpListener) {
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!(addr = %local, "session server listening");

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(%peer, "connection accepted");
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_session(context, socket).await {
                        debug!(%peer, error = %e, "session ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn run_session(context: ServerContext, socket: TcpStream) -> std::io::Result<()> {
    let mut framed = Framed::new(socket, FrameCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let raw = match std::str::from_utf8(&frame) {
            Ok(raw) => raw,
            Err(_) => {
                let error = RequestError {
                    kind: "MalformedStream",
                    message: "frame is not UTF-8".to_string(),
                };
                framed.send(error_frame(&error)).await?;
                continue;
            }
        };
        if raw.trim().is_empty() {
            continue;
        }

        match parse_request(raw) {
            Ok(Request::Watch { path }) => {
                run_watch(&context, &mut framed, path).await?;
            }
            Ok(request) => {
                let response = match handle_request(&context, request).await {
                    Ok(frame) => frame,
                    Err(error) => error_frame(&error),
                };
                framed.send(response).await?;
            }
            Err(error) => {
                framed.send(error_frame(&error)).await?;
            }
        }
    }
    Ok(())
}

/// Streams one frame per commit that overlaps the watched path, until the
/// client closes the connection or sends another frame (which cancels the
/// watch and is processed normally by the caller's loop).
async fn run_watch(
    context: &ServerContext,
    framed: &mut Framed<TcpStream, FrameCodec>,
    path: KindedPath,
) -> std::io::Result<()> {
    let mut commits = context.store.subscribe();
    debug!(path = %path, "watch started");

    loop {
        tokio::select! {
            notice = commits.recv() => {
                let notice = match notice {
                    Ok(notice) => notice,
                    Err(_) => return Ok(()),
                };
                let overlaps = notice.paths.iter().any(|committed| {
                    let (down, equal) = path.ancestor_or_equal(committed);
                    let (up, _) = committed.ancestor_or_equal(&path);
                    down || up || equal
                });
                if !overlaps {
                    continue;
                }
                let value = match context.store.read_path(&path).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(path = %path, error = %e, "watch read failed");
                        None
                    }
                };
                framed
                    .send(watch_frame(notice.commit, &path, value.as_ref()))
                    .await?;
            }
            next = framed.next() => {
                match next {
                    // Client spoke again: the watch is canceled. The frame
                    // itself is handled as a fresh request.
                    Some(Ok(frame)) => {
                        debug!(path = %path, "watch canceled by client");
                        if let Ok(raw) = std::str::from_utf8(&frame) {
                            if raw.trim().is_empty() {
                                continue;
                            }
                            let response = match parse_request(raw) {
                                Ok(Request::Watch { path }) => {
                                    return Box::pin(run_watch(context, framed, path)).await;
                                }
                                Ok(request) => match handle_request(context, request).await {
                                    Ok(frame) => frame,
                                    Err(error) => error_frame(&error),
                                },
                                Err(error) => error_frame(&error),
                            };
                            framed.send(response).await?;
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                }
            }
        }
    }
}

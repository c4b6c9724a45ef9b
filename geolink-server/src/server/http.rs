//! HTTP transport for the OwnTracks protocol.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::protocol::owntracks::{
    self,
    OwnTracksState,
};

pub async fn serve(
    listener: TcpListener,
    state: OwnTracksState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = owntracks::router(state);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
}

use std::future::ready;
use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};

pub type TextSink = Pin<Box<dyn Sink<String, Error = axum::Error> + Send>>;

/// Splits an upgraded socket into the text-frame stream and sink the session
/// drivers consume.
///
/// The stream ends at the first close frame or transport error. Binary, ping
/// and pong frames are skipped.
pub fn split_text(socket: WebSocket) -> (BoxStream<'static, String>, TextSink) {
    let (sink, stream) = socket.split();

    let inbound = stream
        .take_while(|frame| ready(matches!(frame, Ok(msg) if !matches!(msg, Message::Close(_)))))
        .filter_map(|frame| {
            ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        })
        .boxed();

    let outbound = sink
        .with(|text: String| ready(Ok::<_, axum::Error>(Message::Text(text.into()))));

    (inbound, Box::pin(outbound))
}

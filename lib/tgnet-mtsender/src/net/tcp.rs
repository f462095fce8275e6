// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::io;

use bytes::{Buf, BufMut};
use futures_util::future::{BoxFuture, FutureExt};
use log::info;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::{Connection, Error, PacketReader, PacketWriter, ServerAddr, TransportFactory};
use crate::errors::ReadError;

const INTERMEDIATE_TAG: u32 = 0xee_ee_ee_ee;

/// Packets larger than this are considered a framing error.
const MAXIMUM_PACKET_LEN: i32 = 16 * 1024 * 1024;

/// Plain TCP sockets framed with the [intermediate transport]:
///
/// ```text
/// +----+----...----+
/// | len|  payload  |
/// +----+----...----+
///  ^^^^ 4 bytes
/// ```
///
/// The very first packet is preceded by the `0xeeeeeeee` tag.
///
/// [intermediate transport]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
#[derive(Clone, Copy, Debug, Default)]
pub struct IntermediateTcp;

impl TransportFactory for IntermediateTcp {
    fn connect(&self, addr: &ServerAddr) -> BoxFuture<'static, io::Result<Connection>> {
        let addr = addr.clone();
        async move {
            info!("connecting to dc {} at {}...", addr.dc_id, addr.address);
            let stream = TcpStream::connect(addr.address).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok(Connection {
                reader: Box::new(IntermediateReader { stream: reader }),
                writer: Box::new(IntermediateWriter {
                    stream: writer,
                    init: false,
                }),
            })
        }
        .boxed()
    }
}

struct IntermediateWriter {
    stream: OwnedWriteHalf,
    init: bool,
}

impl PacketWriter for IntermediateWriter {
    fn write_packet(&mut self, packet: Vec<u8>) -> BoxFuture<'_, io::Result<()>> {
        async move {
            let frame = pack(&packet, !self.init);
            self.init = true;
            self.stream.write_all(&frame).await
        }
        .boxed()
    }
}

struct IntermediateReader {
    stream: OwnedReadHalf,
}

impl PacketReader for IntermediateReader {
    fn read_packet(&mut self) -> BoxFuture<'_, Result<Vec<u8>, ReadError>> {
        async move {
            let mut header = [0; 4];
            self.stream.read_exact(&mut header).await?;
            let len = check_len(i32::from_le_bytes(header))?;

            let mut payload = vec![0; len];
            self.stream.read_exact(&mut payload).await?;
            if len == 4 {
                let status = (&payload[..]).get_i32_le();
                return Err(Error::BadStatus {
                    status: status.unsigned_abs(),
                }
                .into());
            }
            Ok(payload)
        }
        .boxed()
    }
}

fn pack(packet: &[u8], with_tag: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(packet.len() + 8);
    if with_tag {
        frame.put_u32_le(INTERMEDIATE_TAG);
    }
    frame.put_i32_le(packet.len() as i32);
    frame.put_slice(packet);
    frame
}

fn check_len(len: i32) -> Result<usize, Error> {
    if len == 4 || (len > 4 && len <= MAXIMUM_PACKET_LEN && len % 4 == 0) {
        Ok(len as usize)
    } else {
        Err(Error::BadLen { got: len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_is_tagged() {
        let frame = pack(&[1, 2, 3, 4], true);
        assert_eq!(frame, [0xee, 0xee, 0xee, 0xee, 4, 0, 0, 0, 1, 2, 3, 4]);

        let frame = pack(&[1, 2, 3, 4, 5, 6, 7, 8], false);
        assert_eq!(frame, [8, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn bad_lengths_are_rejected() {
        assert_eq!(check_len(4), Ok(4));
        assert_eq!(check_len(128), Ok(128));
        assert_eq!(check_len(0), Err(Error::BadLen { got: 0 }));
        assert_eq!(check_len(-404), Err(Error::BadLen { got: -404 }));
        assert_eq!(check_len(7), Err(Error::BadLen { got: 7 }));
    }

    #[tokio::test]
    async fn status_packets_are_errors() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = [0; 16];
            socket.read_exact(&mut received).await.unwrap();
            let mut reply = Vec::new();
            reply.put_i32_le(8);
            reply.put_slice(&[9, 9, 9, 9, 8, 8, 8, 8]);
            reply.put_i32_le(4);
            reply.put_i32_le(-404);
            socket.write_all(&reply).await.unwrap();
            received
        });

        let mut conn = IntermediateTcp
            .connect(&ServerAddr {
                dc_id: 2,
                address,
                media: false,
                test_mode: true,
            })
            .await
            .unwrap();
        conn.writer.write_packet(vec![1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();

        assert_eq!(conn.reader.read_packet().await.unwrap(), [9, 9, 9, 9, 8, 8, 8, 8]);
        match conn.reader.read_packet().await {
            Err(ReadError::Transport(Error::BadStatus { status: 404 })) => {}
            other => panic!("unexpected result: {other:?}"),
        }

        let received = server.await.unwrap();
        assert_eq!(&received[..8], &[0xee, 0xee, 0xee, 0xee, 8, 0, 0, 0]);
    }
}

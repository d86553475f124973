//! Messages exchanged between simulated nodes and their framing on a pipe.

use crate::types::{Block, Hash, Transaction};
use bytes::{Buf, BufMut};
use commonware_codec::{
    DecodeExt, Encode, EncodeSize, Error as CodecError, Read, ReadExt, ReadRangeExt, Write,
};
use commonware_runtime::{Sink, Stream};
use commonware_stream::utils::codec::{recv_frame, send_frame};
use thiserror::Error;

/// Maximum number of transactions in a single gossip message.
pub const MAX_GOSSIP_TRANSACTIONS: usize = 1024;

/// Maximum number of blocks in a single sync response.
pub const MAX_SYNC_BLOCKS: usize = 64;

/// Errors that can occur when exchanging messages.
#[derive(Error, Debug)]
pub enum Error {
    #[error("frame: {0}")]
    Frame(#[from] commonware_stream::Error),
    #[error("unable to decode: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Sent by both ends when a session opens.
    Status { height: u64, head: Hash },
    /// Transaction gossip (execution overlay).
    Transactions(Vec<Transaction>),
    /// Request canonical blocks starting at `from` (execution overlay).
    GetBlocks { from: u64 },
    /// Response to [Message::GetBlocks].
    Blocks(Vec<Block>),
    /// A newly proposed block (consensus overlay).
    Commit(Block),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Status { .. } => "status",
            Message::Transactions(_) => "transactions",
            Message::GetBlocks { .. } => "get_blocks",
            Message::Blocks(_) => "blocks",
            Message::Commit(_) => "commit",
        }
    }
}

impl Write for Message {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Message::Status { height, head } => {
                0u8.write(writer);
                height.write(writer);
                head.write(writer);
            }
            Message::Transactions(transactions) => {
                1u8.write(writer);
                transactions.write(writer);
            }
            Message::GetBlocks { from } => {
                2u8.write(writer);
                from.write(writer);
            }
            Message::Blocks(blocks) => {
                3u8.write(writer);
                blocks.write(writer);
            }
            Message::Commit(block) => {
                4u8.write(writer);
                block.write(writer);
            }
        }
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        1 + match self {
            Message::Status { height, head } => height.encode_size() + head.encode_size(),
            Message::Transactions(transactions) => transactions.encode_size(),
            Message::GetBlocks { from } => from.encode_size(),
            Message::Blocks(blocks) => blocks.encode_size(),
            Message::Commit(block) => block.encode_size(),
        }
    }
}

impl Read for Message {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let tag = u8::read(reader)?;
        match tag {
            0 => Ok(Message::Status {
                height: u64::read(reader)?,
                head: Hash::read(reader)?,
            }),
            1 => Ok(Message::Transactions(Vec::<Transaction>::read_range(
                reader,
                ..=MAX_GOSSIP_TRANSACTIONS,
            )?)),
            2 => Ok(Message::GetBlocks {
                from: u64::read(reader)?,
            }),
            3 => Ok(Message::Blocks(Vec::<Block>::read_range(
                reader,
                ..=MAX_SYNC_BLOCKS,
            )?)),
            4 => Ok(Message::Commit(Block::read(reader)?)),
            _ => Err(CodecError::Invalid("sim::wire::Message", "Invalid type")),
        }
    }
}

/// Encode and send a [Message] as a single length-prefixed frame.
pub async fn send<S: Sink>(
    sink: &mut S,
    message: &Message,
    max_message_size: usize,
) -> Result<(), Error> {
    let data = message.encode();
    send_frame(sink, &data, max_message_size).await?;
    Ok(())
}

/// Receive and decode a [Message].
pub async fn recv<T: Stream>(stream: &mut T, max_message_size: usize) -> Result<Message, Error> {
    let frame = recv_frame(stream, max_message_size).await?;
    Ok(Message::decode(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, UnsignedTransaction, TRANSFER_GAS};
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, mocks, Runner};
    use p256::ecdsa::SigningKey;
    use rand::{rngs::StdRng, SeedableRng};

    const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    fn block() -> Block {
        let key = SigningKey::random(&mut StdRng::seed_from_u64(0));
        let tx = UnsignedTransaction {
            chain_id: 1,
            nonce: 0,
            to: Address([4u8; 20]),
            value: 10,
            gas: TRANSFER_GAS,
            gas_price: 1,
        }
        .sign(&key);
        Block::new(1, Hash([8u8; 32]), 1, Address([5u8; 20]), vec![tx])
    }

    #[test_traced]
    fn test_messages_over_channel() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (mut sink, mut stream) = mocks::Channel::init();
            let messages = vec![
                Message::Status {
                    height: 3,
                    head: Hash([1u8; 32]),
                },
                Message::Transactions(block().transactions),
                Message::GetBlocks { from: 4 },
                Message::Blocks(vec![block(), block()]),
                Message::Commit(block()),
            ];
            for message in &messages {
                send(&mut sink, message, MAX_MESSAGE_SIZE).await.unwrap();
            }
            for message in messages {
                assert_eq!(recv(&mut stream, MAX_MESSAGE_SIZE).await.unwrap(), message);
            }
        });
    }

    #[test_traced]
    fn test_oversized_message() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (mut sink, mut stream) = mocks::Channel::init();
            let message = Message::Blocks(vec![block(), block()]);
            let size = message.encode_size();
            assert!(matches!(
                send(&mut sink, &message, size - 1).await,
                Err(Error::Frame(commonware_stream::Error::SendTooLarge(n))) if n == size
            ));

            send(&mut sink, &message, size).await.unwrap();
            assert!(matches!(
                recv(&mut stream, size - 1).await,
                Err(Error::Frame(commonware_stream::Error::RecvTooLarge(n))) if n == size
            ));
        });
    }

    #[test]
    fn test_gossip_limit() {
        let tx = block().transactions.remove(0);
        let message = Message::Transactions(vec![tx; MAX_GOSSIP_TRANSACTIONS + 1]);
        assert!(matches!(
            Message::decode(message.encode().freeze()),
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_unknown_tag() {
        let buf = Bytes::from_static(&[9]);
        assert!(matches!(
            Message::decode(buf),
            Err(CodecError::Invalid("sim::wire::Message", _))
        ));
    }
}

//! WebSocket message handling on top of [`FrameParser`].
//!
//! Reassembles fragmented data messages, answers control frames and hands
//! complete messages to the connection's service. Outbound messages larger than one
//! send buffer are split into a linked chain of frames.

use tracing::{debug, trace};

use jdocs_core::constants::{BUFFER_SIZE, MAX_MESSAGE_SIZE};
use jdocs_core::error::Result;
use jdocs_core::io_backend::IoBackend;

use super::frame::{self, close_code, opcode, Frame, FrameParser, ParseStatus};
use super::ProtocolHandler;
use crate::connection::{ConnIo, Stage};
use crate::service::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    /// Inside a fragmented message.
    Continued,
    /// We sent a close frame; only a close from the peer matters now.
    Closing,
}

#[derive(Debug)]
pub struct WebSocketHandler {
    parser: FrameParser,
    message: Vec<u8>,
    state: State,
    service: Service,
}

impl Default for WebSocketHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketHandler {
    pub fn new() -> Self {
        Self::with_service(Service::Chat)
    }

    pub fn with_service(service: Service) -> Self {
        Self { parser: FrameParser::new(), message: Vec::new(), state: State::Normal, service }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    fn on_frame<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, f: Frame) -> Result<()> {
        trace!(conn_id = io.conn_id(), opcode = f.opcode, fin = f.fin, len = f.payload.len(), "frame");
        if opcode::is_control(f.opcode) {
            return self.on_control(io, f);
        }
        if self.state == State::Closing {
            return Ok(());
        }
        match f.opcode {
            opcode::CONTINUATION => {
                if self.state != State::Continued {
                    return self.fail(io, close_code::PROTOCOL_ERROR);
                }
                if self.message.len() + f.payload.len() > MAX_MESSAGE_SIZE {
                    return self.fail(io, close_code::PAYLOAD_TOO_BIG);
                }
                self.message.extend_from_slice(&f.payload);
                if f.fin {
                    self.state = State::Normal;
                    self.deliver(io)?;
                }
                Ok(())
            }
            opcode::TEXT | opcode::BINARY => {
                if self.state == State::Continued {
                    return self.fail(io, close_code::PROTOCOL_ERROR);
                }
                self.message = f.payload;
                if f.fin {
                    self.deliver(io)
                } else {
                    self.state = State::Continued;
                    Ok(())
                }
            }
            _ => self.fail(io, close_code::UNSUPPORTED_DATA),
        }
    }

    fn on_control<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, f: Frame) -> Result<()> {
        match f.opcode {
            opcode::CLOSE => {
                if self.state != State::Closing {
                    self.send_close(io, close_code::NORMAL, true)?;
                }
                io.close()
            }
            opcode::PING => {
                io.send_with(false, |buf| frame::encode_frame(true, opcode::PONG, &f.payload, buf))?;
                Ok(())
            }
            opcode::PONG => Ok(()),
            _ => self.fail(io, close_code::UNSUPPORTED_DATA),
        }
    }

    fn deliver<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>) -> Result<()> {
        let message = std::mem::take(&mut self.message);
        let reply = self.service.handle(io, &message)?;
        self.send_text(io, reply.as_bytes())
    }

    fn send_close<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, code: u16, link: bool) -> Result<()> {
        debug!(conn_id = io.conn_id(), code, reason = frame::close_reason(code), "sending close frame");
        self.state = State::Closing;
        io.send_with(link, |buf| frame::encode_close(code, buf))?;
        Ok(())
    }

    /// Close frame linked ahead of the teardown; the peer broke the protocol.
    fn fail<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, code: u16) -> Result<()> {
        self.send_close(io, code, true)?;
        io.close()
    }

    /// Send `data` as one text message, fragmenting to fit send buffers.
    pub fn send_text<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, mut data: &[u8]) -> Result<()> {
        let mut op = opcode::TEXT;
        loop {
            let take = frame::affordable_payload(data.len(), BUFFER_SIZE);
            let fin = take == data.len();
            let (chunk, rest) = data.split_at(take);
            if !io.send_with(!fin, |buf| frame::encode_frame(fin, op, chunk, buf))? {
                return Ok(());
            }
            data = rest;
            op = opcode::CONTINUATION;
            if fin {
                return Ok(());
            }
        }
    }
}

impl ProtocolHandler for WebSocketHandler {
    fn stage(&self) -> Stage {
        Stage::WebSocket
    }

    fn on_recv<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() && !io.is_closed() {
            let (used, status) = self.parser.parse(data);
            data = &data[used..];
            match status {
                ParseStatus::NeedMore => break,
                ParseStatus::Frame(f) => self.on_frame(io, f)?,
                ParseStatus::Error(code) => {
                    self.parser.reset();
                    return self.fail(io, code);
                }
            }
        }
        Ok(())
    }

    fn on_message<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>, payload: &[u8]) -> Result<()> {
        if self.state == State::Closing {
            return Ok(());
        }
        self.send_text(io, payload)
    }

    fn on_close<B: IoBackend>(&mut self, io: &mut ConnIo<'_, B>) -> Result<()> {
        self.service.on_close(io)
    }
}

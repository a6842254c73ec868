//! DNS wire format.
//!
//! Encoding covers queries (no name compression); decoding covers responses
//! with compression pointers, with per-record parsing for A, AAAA, PTR,
//! CNAME, and SRV.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::{Error, Result};

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const CLASS_IN: u16 = 1;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_TRUNCATED: u16 = 0x0200;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Other(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

#[derive(Clone, Debug, Default)]
pub struct Message {
    pub id: u16,
    pub response: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub rcode: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

impl Message {
    /// Builds a recursion-desired query for one question.
    pub fn query(id: u16, name: &str, qtype: u16) -> Message {
        Message {
            id,
            response: false,
            truncated: false,
            recursion_desired: true,
            rcode: 0,
            questions: vec![Question {
                name: name.to_string(),
                qtype,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.id.to_be_bytes());
        let mut flags = 0u16;
        if self.response {
            flags |= FLAG_RESPONSE;
        }
        if self.truncated {
            flags |= FLAG_TRUNCATED;
        }
        if self.recursion_desired {
            flags |= FLAG_RECURSION_DESIRED;
        }
        flags |= u16::from(self.rcode) & 0x000f;
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        for question in &self.questions {
            encode_name(&mut buf, &question.name)?;
            buf.extend_from_slice(&question.qtype.to_be_bytes());
            buf.extend_from_slice(&question.qclass.to_be_bytes());
        }
        for answer in &self.answers {
            encode_record(&mut buf, answer)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Message> {
        let mut cursor = Cursor { buf, pos: 0 };
        let id = cursor.u16()?;
        let flags = cursor.u16()?;
        let question_count = cursor.u16()? as usize;
        let answer_count = cursor.u16()? as usize;
        let authority_count = cursor.u16()? as usize;
        let additional_count = cursor.u16()? as usize;

        let mut message = Message {
            id,
            response: flags & FLAG_RESPONSE != 0,
            truncated: flags & FLAG_TRUNCATED != 0,
            recursion_desired: flags & FLAG_RECURSION_DESIRED != 0,
            rcode: (flags & 0x000f) as u8,
            questions: Vec::with_capacity(question_count),
            answers: Vec::with_capacity(answer_count),
        };

        for _ in 0..question_count {
            let name = cursor.name()?;
            let qtype = cursor.u16()?;
            let qclass = cursor.u16()?;
            message.questions.push(Question { name, qtype, qclass });
        }
        for _ in 0..answer_count {
            message.answers.push(cursor.record()?);
        }
        // Authority and additional sections are skipped, but must parse so
        // a malformed tail is detected.
        for _ in 0..(authority_count + additional_count) {
            let _ = cursor.record()?;
        }
        Ok(message)
    }
}

fn encode_name(buf: &mut Vec<u8>, name: &str) -> Result<()> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::AddressMalformed);
    }
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(Error::AddressMalformed);
            }
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
    }
    buf.push(0);
    Ok(())
}

fn encode_record(buf: &mut Vec<u8>, record: &Record) -> Result<()> {
    encode_name(buf, &record.name)?;
    buf.extend_from_slice(&record.rtype.to_be_bytes());
    buf.extend_from_slice(&record.class.to_be_bytes());
    buf.extend_from_slice(&record.ttl.to_be_bytes());
    let mut data = Vec::new();
    match &record.data {
        RecordData::A(addr) => data.extend_from_slice(&addr.octets()),
        RecordData::Aaaa(addr) => data.extend_from_slice(&addr.octets()),
        RecordData::Cname(name) | RecordData::Ptr(name) => encode_name(&mut data, name)?,
        RecordData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            data.extend_from_slice(&priority.to_be_bytes());
            data.extend_from_slice(&weight.to_be_bytes());
            data.extend_from_slice(&port.to_be_bytes());
            encode_name(&mut data, target)?;
        }
        RecordData::Other(bytes) => data.extend_from_slice(bytes),
    }
    if data.len() > u16::MAX as usize {
        return Err(Error::Invalid);
    }
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(&data);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or(Error::AddressMalformed)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::AddressMalformed)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::AddressMalformed)?;
        self.pos = end;
        Ok(slice)
    }

    /// Reads a possibly compressed name starting at the cursor.
    fn name(&mut self) -> Result<String> {
        let (name, next) = decode_name_at(self.buf, self.pos)?;
        self.pos = next;
        Ok(name)
    }

    fn record(&mut self) -> Result<Record> {
        let name = self.name()?;
        let rtype = self.u16()?;
        let class = self.u16()?;
        let ttl = self.u32()?;
        let rdlength = self.u16()? as usize;
        let rdata_start = self.pos;
        let rdata = self.take(rdlength)?;

        let data = match rtype {
            TYPE_A => {
                if rdata.len() != 4 {
                    return Err(Error::AddressMalformed);
                }
                RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
            }
            TYPE_AAAA => {
                if rdata.len() != 16 {
                    return Err(Error::AddressMalformed);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                RecordData::Aaaa(Ipv6Addr::from(octets))
            }
            TYPE_CNAME => RecordData::Cname(decode_name_at(self.buf, rdata_start)?.0),
            TYPE_PTR => RecordData::Ptr(decode_name_at(self.buf, rdata_start)?.0),
            TYPE_SRV => {
                if rdata.len() < 6 {
                    return Err(Error::AddressMalformed);
                }
                RecordData::Srv {
                    priority: u16::from_be_bytes([rdata[0], rdata[1]]),
                    weight: u16::from_be_bytes([rdata[2], rdata[3]]),
                    port: u16::from_be_bytes([rdata[4], rdata[5]]),
                    target: decode_name_at(self.buf, rdata_start + 6)?.0,
                }
            }
            _ => RecordData::Other(rdata.to_vec()),
        };

        Ok(Record {
            name,
            rtype,
            class,
            ttl,
            data,
        })
    }
}

/// Decodes a name at `start`, following compression pointers. Returns the
/// name and the offset just past it in the uncompressed reading.
fn decode_name_at(buf: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut next = None;
    let mut hops = 0;

    loop {
        let len = *buf.get(pos).ok_or(Error::AddressMalformed)? as usize;
        if len & 0xc0 == 0xc0 {
            // Compression pointer: the low 14 bits address the suffix.
            let second = *buf.get(pos + 1).ok_or(Error::AddressMalformed)? as usize;
            if next.is_none() {
                next = Some(pos + 2);
            }
            pos = ((len & 0x3f) << 8) | second;
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(Error::AddressMalformed);
            }
            continue;
        }
        if len & 0xc0 != 0 {
            return Err(Error::AddressMalformed);
        }
        pos += 1;
        if len == 0 {
            break;
        }
        let label = buf.get(pos..pos + len).ok_or(Error::AddressMalformed)?;
        labels.push(
            std::str::from_utf8(label)
                .map_err(|_| Error::AddressMalformed)?
                .to_ascii_lowercase(),
        );
        pos += len;
        if labels.iter().map(|l| l.len() + 1).sum::<usize>() > MAX_NAME_LEN {
            return Err(Error::AddressMalformed);
        }
    }

    Ok((labels.join("."), next.unwrap_or(pos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_roundtrip() {
        let query = Message::query(0x1234, "example.test", TYPE_A);
        let wire = query.encode().unwrap();
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded.id, 0x1234);
        assert!(!decoded.response);
        assert!(decoded.recursion_desired);
        assert_eq!(decoded.questions.len(), 1);
        assert_eq!(decoded.questions[0].name, "example.test");
        assert_eq!(decoded.questions[0].qtype, TYPE_A);
    }

    #[test]
    fn response_with_compressed_answer() {
        // Header + question "a.test" + answer whose name is a pointer back
        // to offset 12 (the question name).
        let mut wire = Vec::new();
        wire.extend_from_slice(&0x0001u16.to_be_bytes());
        wire.extend_from_slice(&0x8180u16.to_be_bytes());
        wire.extend_from_slice(&1u16.to_be_bytes()); // questions
        wire.extend_from_slice(&1u16.to_be_bytes()); // answers
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&[1, b'a', 4, b't', b'e', b's', b't', 0]);
        wire.extend_from_slice(&TYPE_A.to_be_bytes());
        wire.extend_from_slice(&CLASS_IN.to_be_bytes());
        wire.extend_from_slice(&[0xc0, 12]); // pointer to the question name
        wire.extend_from_slice(&TYPE_A.to_be_bytes());
        wire.extend_from_slice(&CLASS_IN.to_be_bytes());
        wire.extend_from_slice(&60u32.to_be_bytes());
        wire.extend_from_slice(&4u16.to_be_bytes());
        wire.extend_from_slice(&[192, 0, 2, 7]);

        let message = Message::decode(&wire).unwrap();
        assert!(message.response);
        assert_eq!(message.answers.len(), 1);
        assert_eq!(message.answers[0].name, "a.test");
        assert_eq!(message.answers[0].ttl, 60);
        assert_eq!(
            message.answers[0].data,
            RecordData::A(Ipv4Addr::new(192, 0, 2, 7))
        );
    }

    #[test]
    fn srv_record_parses() {
        let record = Record {
            name: "_svc._tcp.example.test".into(),
            rtype: TYPE_SRV,
            class: CLASS_IN,
            ttl: 30,
            data: RecordData::Srv {
                priority: 10,
                weight: 5,
                port: 8080,
                target: "node.example.test".into(),
            },
        };
        let mut response = Message::query(9, "_svc._tcp.example.test", TYPE_SRV);
        response.response = true;
        response.answers.push(record.clone());
        let wire = response.encode().unwrap();
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded.answers[0], record);
    }

    #[test]
    fn pointer_loop_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&0x0002u16.to_be_bytes());
        wire.extend_from_slice(&0x8000u16.to_be_bytes());
        wire.extend_from_slice(&1u16.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        // A name that points at itself.
        wire.extend_from_slice(&[0xc0, 12]);
        wire.extend_from_slice(&TYPE_A.to_be_bytes());
        wire.extend_from_slice(&CLASS_IN.to_be_bytes());
        assert!(Message::decode(&wire).is_err());
    }

    #[test]
    fn truncation_flag_survives() {
        let mut message = Message::query(7, "big.test", TYPE_A);
        message.response = true;
        message.truncated = true;
        let wire = message.encode().unwrap();
        assert!(Message::decode(&wire).unwrap().truncated);
    }
}

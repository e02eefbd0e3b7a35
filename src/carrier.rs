//! Payload carriers.
//!
//! A tunnel packet is a byte string. Outbound it rides in the query name as
//! hex labels under the tunnel domain, behind a random cache-busting salt
//! label. Inbound it comes back in the answer rdata, encoded per record
//! type: hex character-strings for TXT, hex labels for CNAME/NS/MX, raw
//! length-prefixed chunks for A/AAAA.

use rand::Rng;

use crate::dns::{
    DnsError, Name, Question, RData, RecordType, ResourceRecord, MAX_LABEL_LEN, MAX_NAME_LEN,
};

/// Length of the random cache-busting label prefixed to every query name.
pub const SALT_LEN: usize = 6;

/// Preference word used for MX carrier answers.
pub const MX_PREFERENCE: u16 = 10;

/// Answers must not be cached; every exchange is unique.
pub const ANSWER_TTL: u32 = 0;

const SALT_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A fresh salt label. Recursive resolvers never see the same query name
/// twice, so they can never serve a cached answer.
pub fn random_salt() -> String {
    let mut rng = rand::thread_rng();
    (0..SALT_LEN)
        .map(|_| SALT_ALPHABET[rng.gen_range(0..SALT_ALPHABET.len())] as char)
        .collect()
}

/// Largest payload whose encoded query name fits the 255-byte wire limit
/// under `domain`. Zero means the domain leaves no room at all.
pub fn max_payload(domain: &Name) -> usize {
    let overhead = domain.wire_len() + 1 + SALT_LEN;
    let avail = MAX_NAME_LEN.saturating_sub(overhead);
    // Each full label costs a length byte plus 63 hex chars.
    let full = avail / (MAX_LABEL_LEN + 1) * MAX_LABEL_LEN;
    let rem = (avail % (MAX_LABEL_LEN + 1)).saturating_sub(1);
    (full + rem) / 2
}

/// Encode `payload` as `<salt>.<hex labels...>.<domain>`.
///
/// Fails with `Oversize` when the result would not fit 255 wire bytes; the
/// session engine fragments and retries with less data.
pub fn encode_query_name(payload: &[u8], domain: &Name, salt: &str) -> Result<Name, DnsError> {
    let hexed = hex::encode(payload);
    let mut labels = Vec::with_capacity(2 + hexed.len() / MAX_LABEL_LEN + domain.labels().len());
    labels.push(salt.to_string());
    for chunk in hexed.as_bytes().chunks(MAX_LABEL_LEN) {
        labels.push(String::from_utf8_lossy(chunk).into_owned());
    }
    labels.extend(domain.labels().iter().cloned());
    Name::from_labels(labels).map_err(|_| DnsError::Oversize)
}

/// Recover the payload from a query name produced by [`encode_query_name`].
pub fn decode_query_name(name: &Name, domain: &Name) -> Result<Vec<u8>, DnsError> {
    let rest = name
        .strip_suffix(domain)
        .ok_or(DnsError::BadCarrier("name outside tunnel domain"))?;
    if rest.is_empty() {
        return Err(DnsError::BadCarrier("missing salt label"));
    }
    let hexed: String = rest[1..].concat();
    hex::decode(&hexed).map_err(|_| DnsError::BadCarrier("bad hex in query name"))
}

/// Encode a reply payload into answer records matching `question`.
pub fn encode_answer(
    question: &Question,
    payload: &[u8],
    domain: &Name,
) -> Result<Vec<ResourceRecord>, DnsError> {
    let answer = |rdata| ResourceRecord::new(question.name.clone(), question.qtype, ANSWER_TTL, rdata);

    match question.qtype {
        RecordType::Txt | RecordType::Any => {
            let hexed = hex::encode(payload);
            let strings: Vec<Vec<u8>> = hexed.as_bytes().chunks(255).map(<[u8]>::to_vec).collect();
            let rr = ResourceRecord::new(
                question.name.clone(),
                RecordType::Txt,
                ANSWER_TTL,
                RData::Txt(strings),
            );
            Ok(vec![rr])
        }
        RecordType::Cname => Ok(vec![answer(RData::Cname(answer_name(payload, domain)?))]),
        RecordType::Ns => Ok(vec![answer(RData::Ns(answer_name(payload, domain)?))]),
        RecordType::Mx => Ok(vec![answer(RData::Mx {
            preference: MX_PREFERENCE,
            exchange: answer_name(payload, domain)?,
        })]),
        RecordType::A => {
            if payload.len() > u8::MAX as usize {
                return Err(DnsError::Oversize);
            }
            Ok(chunked_answers(payload, 4)
                .into_iter()
                .map(|octets| {
                    let mut four = [0u8; 4];
                    four.copy_from_slice(&octets);
                    answer(RData::A(four.into()))
                })
                .collect())
        }
        RecordType::Aaaa => {
            if payload.len() > u8::MAX as usize {
                return Err(DnsError::Oversize);
            }
            Ok(chunked_answers(payload, 16)
                .into_iter()
                .map(|octets| {
                    let mut sixteen = [0u8; 16];
                    sixteen.copy_from_slice(&octets);
                    answer(RData::Aaaa(sixteen.into()))
                })
                .collect())
        }
        RecordType::Unknown(_) => Err(DnsError::BadCarrier("unsupported carrier type")),
    }
}

/// Recover the reply payload from the answers of a response.
pub fn decode_answer(answers: &[ResourceRecord], domain: &Name) -> Result<Vec<u8>, DnsError> {
    let first = answers.first().ok_or(DnsError::BadCarrier("no answers"))?;
    match &first.rdata {
        RData::Txt(strings) => {
            let hexed: Vec<u8> = strings.iter().flatten().copied().collect();
            hex::decode(&hexed).map_err(|_| DnsError::BadCarrier("bad hex in TXT answer"))
        }
        RData::Cname(name) | RData::Ns(name) => decode_answer_name(name, domain),
        RData::Mx { exchange, .. } => decode_answer_name(exchange, domain),
        RData::A(_) => {
            let mut blob = Vec::new();
            for rr in answers {
                if let RData::A(addr) = &rr.rdata {
                    blob.extend_from_slice(&addr.octets());
                }
            }
            strip_length_prefix(&blob)
        }
        RData::Aaaa(_) => {
            let mut blob = Vec::new();
            for rr in answers {
                if let RData::Aaaa(addr) = &rr.rdata {
                    blob.extend_from_slice(&addr.octets());
                }
            }
            strip_length_prefix(&blob)
        }
        RData::Unknown(_) => Err(DnsError::BadCarrier("unsupported answer type")),
    }
}

/// Hex labels under the tunnel domain, no salt. Answers are never cached
/// (the query name already was unique) so they carry none.
fn answer_name(payload: &[u8], domain: &Name) -> Result<Name, DnsError> {
    let hexed = hex::encode(payload);
    let mut labels = Vec::with_capacity(1 + hexed.len() / MAX_LABEL_LEN + domain.labels().len());
    for chunk in hexed.as_bytes().chunks(MAX_LABEL_LEN) {
        labels.push(String::from_utf8_lossy(chunk).into_owned());
    }
    labels.extend(domain.labels().iter().cloned());
    Name::from_labels(labels).map_err(|_| DnsError::Oversize)
}

fn decode_answer_name(name: &Name, domain: &Name) -> Result<Vec<u8>, DnsError> {
    let rest = name
        .strip_suffix(domain)
        .ok_or(DnsError::BadCarrier("answer name outside tunnel domain"))?;
    let hexed: String = rest.concat();
    hex::decode(&hexed).map_err(|_| DnsError::BadCarrier("bad hex in answer name"))
}

/// `[len u8] ++ payload`, split into fixed-size rdata chunks, zero padded.
fn chunked_answers(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let mut blob = Vec::with_capacity(1 + payload.len());
    blob.push(payload.len() as u8);
    blob.extend_from_slice(payload);
    while blob.len() % chunk_size != 0 {
        blob.push(0);
    }
    blob.chunks(chunk_size).map(<[u8]>::to_vec).collect()
}

fn strip_length_prefix(blob: &[u8]) -> Result<Vec<u8>, DnsError> {
    let (&len, rest) = blob
        .split_first()
        .ok_or(DnsError::BadCarrier("empty address carrier"))?;
    let len = len as usize;
    if len > rest.len() {
        return Err(DnsError::BadCarrier("address carrier shorter than its length"));
    }
    Ok(rest[..len].to_vec())
}

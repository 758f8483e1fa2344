use {
    super::errors::{RtmpError, RtmpErrorValue},
    crate::bytesio::bytes_writer::BytesWriter,
    byteorder::BigEndian,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1536;

fn random_packet(epoch: u32) -> Result<Vec<u8>, RtmpError> {
    let mut writer = BytesWriter::with_capacity(HANDSHAKE_SIZE);
    writer.write_u32::<BigEndian>(epoch)?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_random_bytes((HANDSHAKE_SIZE - 8) as u32)?;
    Ok(writer.extract_current_bytes().to_vec())
}

/// Server side of the simple (non-digest) handshake:
/// C0+C1 -> S0+S1+S2 -> C2. S2 echoes C1.
pub async fn server_handshake<S>(io: &mut S) -> Result<(), RtmpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
    io.read_exact(&mut c0c1).await?;
    if c0c1[0] != RTMP_VERSION {
        return Err(RtmpErrorValue::BadVersion(c0c1[0]).into());
    }

    let mut response = Vec::with_capacity(1 + HANDSHAKE_SIZE * 2);
    response.push(RTMP_VERSION);
    response.extend_from_slice(&random_packet(0)?);
    response.extend_from_slice(&c0c1[1..]);
    io.write_all(&response).await?;
    io.flush().await?;

    let mut c2 = vec![0u8; HANDSHAKE_SIZE];
    io.read_exact(&mut c2).await?;
    Ok(())
}

/// Client side: C0+C1 -> S0+S1+S2 -> C2 (echo of S1).
pub async fn client_handshake<S>(io: &mut S) -> Result<(), RtmpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0c1 = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&random_packet(0)?);
    io.write_all(&c0c1).await?;
    io.flush().await?;

    let mut s0s1s2 = vec![0u8; 1 + HANDSHAKE_SIZE * 2];
    io.read_exact(&mut s0s1s2).await?;
    if s0s1s2[0] != RTMP_VERSION {
        return Err(RtmpErrorValue::BadVersion(s0s1s2[0]).into());
    }
    io.write_all(&s0s1s2[1..=HANDSHAKE_SIZE]).await?;
    io.flush().await?;
    Ok(())
}

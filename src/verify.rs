// Streaming signature verification (spec §4.3).  A direct generalization
// of the teacher's `io/verify.rs`: the teacher embeds one fixed keyring at
// compile time and reports to stderr; here the caller supplies whichever
// keyring applies (archive-master, image-master, image-signing or
// device-signing) and the verifier does not report anywhere on its own --
// the state machine decides what to do with a failure.

use anyhow::{bail, Context, Result};
use pipe::{pipe, PipeReader, PipeWriter};
use sequoia_openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationError, VerificationHelper,
};
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::{Cert, KeyHandle};
use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

/// Wraps a reader, verifying a detached OpenPGP signature over every byte
/// that passes through it.  The caller must read to EOF before calling
/// [`VerifyReader::verify`]; reading less than the full stream makes
/// verification fail, the same as the teacher's image-download path.
pub struct VerifyReader<R: Read> {
    source: R,
    verify_pipe: Option<PipeWriter>,
    verify_thread: Option<JoinHandle<Result<()>>>,
    success: Option<bool>,
}

impl<R: Read> VerifyReader<R> {
    pub fn new(source: R, signature: &[u8], certs: Vec<Cert>) -> Result<Self> {
        fn verify(reader: PipeReader, signature: Vec<u8>, certs: Vec<Cert>) -> Result<()> {
            let policy = StandardPolicy::new();
            let helper = VerifyHelper { certs };
            let mut verifier = DetachedVerifierBuilder::from_bytes(&signature)
                .context("parsing signature")?
                .with_policy(&policy, None, helper)
                .context("creating signature verifier")?;
            verifier.verify_reader(reader)
        }
        let (pipe_read, pipe_write) = pipe();
        let sig = signature.to_vec();
        let verify_thread = thread::Builder::new()
            .name("sig-verify".into())
            .spawn(move || verify(pipe_read, sig, certs))
            .context("spawning signature verification thread")?;

        Ok(VerifyReader {
            source,
            verify_pipe: Some(pipe_write),
            verify_thread: Some(verify_thread),
            success: None,
        })
    }

    /// Finish verification and return the result.  Idempotent: later calls
    /// return the cached result rather than re-joining the thread.
    pub fn verify(&mut self) -> Result<()> {
        if self.verify_thread.is_some() {
            let thread = self.verify_thread.take().unwrap();
            self.verify_pipe.take();
            let result = match thread.join() {
                Ok(res) => res,
                Err(e) => std::panic::resume_unwind(e),
            };
            self.success = Some(result.is_ok());
            if let Err(e) = result {
                bail!(e);
            }
            return Ok(());
        }
        if self.success == Some(true) {
            Ok(())
        } else {
            bail!("signature verification failure")
        }
    }
}

impl<R: Read> Read for VerifyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.verify_pipe.is_none() {
            return Ok(0);
        }
        let count = self.source.read(buf)?;
        if count > 0 {
            self.verify_pipe.as_mut().unwrap().write_all(&buf[..count])?;
        }
        Ok(count)
    }
}

struct VerifyHelper {
    certs: Vec<Cert>,
}

impl VerificationHelper for VerifyHelper {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> Result<Vec<Cert>> {
        Ok(self.certs.clone())
    }

    fn check(&mut self, structure: MessageStructure) -> Result<()> {
        if structure.len() != 1 {
            bail!("wrong number of layers ({}) in message structure", structure.len());
        }
        if let MessageLayer::SignatureGroup { ref results } = structure[0] {
            let mut errs = Vec::new();
            for res in results {
                use VerificationError::*;
                match res {
                    Ok(_) => return Ok(()),
                    Err(MalformedSignature { error, .. }) => {
                        errs.push(format!("malformed signature: {error}"));
                    }
                    Err(MissingKey { .. }) => errs.push("missing key".to_string()),
                    Err(UnboundKey { error, .. }) => errs.push(format!("unbound key: {error}")),
                    Err(BadKey { error, .. }) => errs.push(format!("bad key: {error}")),
                    Err(BadSignature { error, .. }) => errs.push(format!("bad signature: {error}")),
                }
            }
            if !errs.is_empty() {
                bail!(errs.join("\n"));
            }
        }
        bail!("couldn't find any signatures");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequoia_openpgp::cert::CertBuilder;
    use sequoia_openpgp::serialize::stream::{Message, Signer};

    fn test_cert() -> Cert {
        CertBuilder::general_purpose(None, Some("test <test@example.com>"))
            .generate()
            .unwrap()
            .0
    }

    fn detached_sign(cert: &Cert, data: &[u8]) -> Vec<u8> {
        let keypair = cert
            .primary_key()
            .key()
            .clone()
            .parts_into_secret()
            .unwrap()
            .into_keypair()
            .unwrap();
        let mut sig = Vec::new();
        {
            let message = Message::new(&mut sig);
            let mut signer = Signer::new(message, keypair)
                .detached()
                .build()
                .unwrap();
            signer.write_all(data).unwrap();
            signer.finalize().unwrap();
        }
        sig
    }

    #[test]
    fn test_good_signature() {
        let cert = test_cert();
        let data = b"a keyring archive blob";
        let sig = detached_sign(&cert, data);

        let mut reader = VerifyReader::new(&data[..], &sig, vec![cert]).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        reader.verify().unwrap();
        reader.verify().unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_bad_signature() {
        let cert = test_cert();
        let mut data = b"a keyring archive blob".to_vec();
        let sig = detached_sign(&cert, &data);
        data[0] ^= 0xff;

        let mut reader = VerifyReader::new(&data[..], &sig, vec![cert]).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        reader.verify().unwrap_err();
    }

    #[test]
    fn test_wrong_key() {
        let signing_cert = test_cert();
        let other_cert = test_cert();
        let data = b"a keyring archive blob";
        let sig = detached_sign(&signing_cert, data);

        let mut reader = VerifyReader::new(&data[..], &sig, vec![other_cert]).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        reader.verify().unwrap_err();
    }
}

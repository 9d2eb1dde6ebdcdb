use bytes::{BufMut, Bytes, BytesMut};

/// A request to send to the server: an ordered list of binary safe arguments, the first one being
/// the command name. Encoded as a RESP array of bulk strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl AsRef<[u8]>) -> Command {
        Command {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Command {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn push_arg(&mut self, arg: impl AsRef<[u8]>) {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Command name, for logging.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|name| String::from_utf8_lossy(name).to_uppercase())
            .unwrap_or_default()
    }

    /// Number of bytes [`Command::encode`] will produce.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + decimal_len(self.args.len()) + 2;
        for arg in &self.args {
            len += 1 + decimal_len(arg.len()) + 2 + arg.len() + 2;
        }
        len
    }

    /// `*<argc>\r\n` followed by `$<len>\r\n<arg>\r\n` for every argument.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(b'*');
        put_decimal(dst, self.args.len());
        dst.put_slice(b"\r\n");
        for arg in &self.args {
            dst.put_u8(b'$');
            put_decimal(dst, arg.len());
            dst.put_slice(b"\r\n");
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst);
        dst.freeze()
    }

    pub fn ping() -> Command {
        Command::new("PING")
    }

    pub fn auth(password: &str) -> Command {
        Command::new("AUTH").arg(password)
    }

    pub fn select(db: i64) -> Command {
        Command::new("SELECT").arg(db.to_string())
    }

    pub fn role() -> Command {
        Command::new("ROLE")
    }

    pub fn asking() -> Command {
        Command::new("ASKING")
    }

    pub fn cluster_slots() -> Command {
        Command::new("CLUSTER").arg("SLOTS")
    }

    pub fn sentinel_master_addr(master_name: &str) -> Command {
        Command::new("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(master_name)
    }

    pub fn subscribe(channel: &str) -> Command {
        Command::new("SUBSCRIBE").arg(channel)
    }

    pub fn unsubscribe(channel: &str) -> Command {
        Command::new("UNSUBSCRIBE").arg(channel)
    }

    pub fn publish(channel: &str, message: impl AsRef<[u8]>) -> Command {
        Command::new("PUBLISH").arg(channel).arg(message)
    }
}

fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

fn put_decimal(dst: &mut BytesMut, n: usize) {
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    let mut n = n;
    loop {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    dst.put_slice(&buf[i..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_set() {
        let cmd = Command::new("SET").arg("mykey").arg("myvalue");

        assert_eq!(
            cmd.encode(),
            Bytes::from_static(b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n")
        );
    }

    #[test]
    fn encode_binary_and_empty_args() {
        let cmd = Command::new("SET").arg(b"a\r\nb").arg("");

        assert_eq!(
            cmd.encode(),
            Bytes::from_static(b"*3\r\n$3\r\nSET\r\n$4\r\na\r\nb\r\n$0\r\n\r\n")
        );
    }

    #[test]
    fn encoded_len_matches_output() {
        let mut cmd = Command::new("MSET");
        for i in 0..12 {
            cmd.push_arg(format!("key-{}", i));
            cmd.push_arg("x".repeat(i * 7));
        }

        assert_eq!(cmd.encoded_len(), cmd.encode().len());
    }

    #[test]
    fn internal_commands() {
        assert_eq!(Command::select(3).args()[1], Bytes::from("3"));
        assert_eq!(Command::cluster_slots().name(), "CLUSTER");
        assert_eq!(
            Command::sentinel_master_addr("mymaster").args(),
            &[
                Bytes::from("SENTINEL"),
                Bytes::from("get-master-addr-by-name"),
                Bytes::from("mymaster")
            ]
        );
    }

    #[test]
    fn decimal_helpers() {
        for n in [0usize, 9, 10, 99, 100, 12345, usize::MAX] {
            let mut dst = BytesMut::new();
            put_decimal(&mut dst, n);
            assert_eq!(&dst[..], n.to_string().as_bytes());
            assert_eq!(decimal_len(n), n.to_string().len());
        }
    }
}

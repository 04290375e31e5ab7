use rand::{Rng, RngCore};

/// n 字节随机数的十六进制表示（长度 2n）
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// 固定位数的十进制随机串（可含前导 0）
pub fn random_digits(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

pub fn new_call_id() -> String {
    format!("{}@gb28181", random_hex(20))
}

pub fn new_branch() -> String {
    format!("z9hG4bK{}", random_hex(10))
}

pub fn new_tag() -> String {
    random_hex(4)
}

/// 十位 SSRC
pub fn new_ssrc() -> String {
    random_digits(10)
}

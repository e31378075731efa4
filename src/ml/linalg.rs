//! PCAで使用する小規模な線形代数ルーチン

use ndarray::{Array1, Array2, Axis};

/// Jacobi法の最大スイープ数
const MAX_SWEEPS: usize = 100;

/// 列を修正グラム・シュミット法で正規直交化する
///
/// 一次従属な列はゼロ列になります。再直交化を1回行います。
pub fn orthonormalize_columns(m: &mut Array2<f64>) {
    let cols = m.ncols();
    for j in 0..cols {
        for _ in 0..2 {
            for i in 0..j {
                let r = m.column(i).dot(&m.column(j));
                let ci = m.column(i).to_owned();
                m.column_mut(j).scaled_add(-r, &ci);
            }
        }
        let norm = m.column(j).dot(&m.column(j)).sqrt();
        if norm > 1e-10 {
            m.column_mut(j).mapv_inplace(|v| v / norm);
        } else {
            m.column_mut(j).fill(0.0);
        }
    }
}

/// 対称行列の固有値分解（巡回Jacobi法）
///
/// 固有値の降順に並べた (固有値, 固有ベクトルを列に持つ行列) を返します。
pub fn symmetric_eigen(a: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut a = a.clone();
    let mut v = Array2::<f64>::eye(n);

    let total: f64 = a.iter().map(|x| x * x).sum();
    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off <= 1e-24 * total || off == 0.0 {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));

    let values = Array1::from_iter(order.iter().map(|&i| a[[i, i]]));
    let vectors = v.select(Axis(1), &order);
    (values, vectors)
}
